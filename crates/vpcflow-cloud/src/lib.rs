//! vpcflow Cloud Capabilities
//!
//! This crate defines the external operations the vpcflow engine consumes:
//! VPC resource management, the classic (legacy) environment, staging object
//! storage and image conversion. The engine never implements vendor
//! semantics; it only calls these traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 vpcflow-engine                   │
//! │   compiler / executor / migration / sweeper      │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                 vpcflow-cloud                    │
//! │  ┌──────────────┐ ┌────────────────┐            │
//! │  │CloudProvider │ │ClassicProvider │            │
//! │  └──────────────┘ └────────────────┘            │
//! │  ┌──────────────┐ ┌────────────────┐            │
//! │  │ ObjectStore  │ │ ImageConverter │            │
//! │  └──────────────┘ └────────────────┘            │
//! └───────┬─────────────────────────────────────────┘
//!         │
//! ┌───────▼───────┐
//! │  MemoryCloud  │  (simulation and tests)
//! └───────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod provider;
pub mod resource;

// Re-exports
pub use error::{CloudError, Result};
pub use memory::MemoryCloud;
pub use provider::{
    AuthStatus, ClassicImage, ClassicInstance, ClassicProvider, CloudProvider, ConversionRequest,
    ConversionState, ImageConverter, ObjectStore, StoredObject,
};
pub use resource::{RemoteResource, RemoteStatus, ResourceKind, ResourceSpec, Scope};
