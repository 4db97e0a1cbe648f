//! vpcflow Core
//!
//! The provisioning request model and every durable record the engine
//! works with: resources, tasks, workflows, migration steps and
//! conversions. Storage goes through the repository traits; `MemoryStore`
//! implements them in process and `StateFile` persists its snapshot.

pub mod error;
pub mod loader;
pub mod model;
pub mod repository;
pub mod state;
pub mod store;

// Re-exports
pub use error::{CoreError, Result};
pub use loader::{load_request, parse_request};
pub use model::*;
pub use repository::{MigrationRepository, ResourceRepository, TaskRepository};
pub use state::{StateDocument, StateFile};
pub use store::{MemoryStore, StoreSnapshot};
