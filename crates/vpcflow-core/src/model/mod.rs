//! Data model
//!
//! The provisioning request plus every durable record the engine reads
//! and writes.

mod migration;
mod report;
mod request;
mod resource;
mod task;

// Re-exports
pub use migration::*;
pub use report::*;
pub use request::*;
pub use resource::*;
pub use task::*;
