//! External capability traits
//!
//! The engine only consumes these operations. Implementations live outside
//! this workspace except for [`crate::memory::MemoryCloud`].

use crate::error::Result;
use crate::resource::{RemoteResource, RemoteStatus, ResourceKind, ResourceSpec, Scope};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// VPC provider abstraction
///
/// One implementation serves every [`ResourceKind`]; the kind is passed
/// through on each call.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Returns the provider name (e.g. "ibm-vpc")
    fn name(&self) -> &str;

    /// Check whether the credentials for `scope` are valid
    async fn check_auth(&self, scope: &Scope) -> Result<AuthStatus>;

    /// Find a live remote object by logical name
    async fn find(
        &self,
        scope: &Scope,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<RemoteResource>>;

    /// Fetch a remote object by id
    async fn get(&self, scope: &Scope, kind: ResourceKind, id: &str) -> Result<RemoteResource>;

    /// List remote objects of one kind
    async fn list(&self, scope: &Scope, kind: ResourceKind) -> Result<Vec<RemoteResource>>;

    /// Create a remote object. The returned value may be partial.
    async fn create(&self, scope: &Scope, spec: &ResourceSpec) -> Result<RemoteResource>;

    /// Update a remote object in place
    async fn update(&self, scope: &Scope, id: &str, spec: &ResourceSpec) -> Result<()>;

    /// Delete a remote object
    async fn delete(&self, scope: &Scope, kind: ResourceKind, id: &str) -> Result<()>;
}

/// Legacy ("classic") environment operations used by the migration pipeline
#[async_trait]
pub trait ClassicProvider: Send + Sync {
    /// Request an image capture of an instance. No image id is returned.
    async fn capture_image(&self, account: &str, instance_id: &str, image_name: &str) -> Result<()>;

    /// Id of the transaction currently running on an instance, if any
    async fn instance_transaction(&self, account: &str, instance_id: &str)
    -> Result<Option<String>>;

    /// Images whose name matches exactly
    async fn find_images(&self, account: &str, name: &str) -> Result<Vec<ClassicImage>>;

    /// Fetch an image by id
    async fn get_image(&self, account: &str, image_id: &str) -> Result<ClassicImage>;

    /// Export an image to staging object storage under `prefix`
    async fn export_image(
        &self,
        account: &str,
        image_id: &str,
        bucket: &str,
        prefix: &str,
    ) -> Result<()>;

    /// Id of the transaction currently running on an image, if any
    async fn image_transaction(&self, account: &str, image_id: &str) -> Result<Option<String>>;

    /// Create an instance from an image, passing opaque user-data
    async fn create_instance(
        &self,
        account: &str,
        image_id: &str,
        name: &str,
        user_data: &str,
    ) -> Result<ClassicInstance>;

    /// Fetch an instance by id
    async fn get_instance(&self, account: &str, instance_id: &str) -> Result<ClassicInstance>;

    /// Whether the instance answers on the network
    async fn is_reachable(&self, account: &str, instance_id: &str) -> Result<bool>;

    /// Delete an instance
    async fn delete_instance(&self, account: &str, instance_id: &str) -> Result<()>;
}

/// Staging object storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<StoredObject>>;

    async fn delete_objects(&self, bucket: &str, names: &[String]) -> Result<()>;
}

/// Image format conversion service
#[async_trait]
pub trait ImageConverter: Send + Sync {
    /// Submit a conversion job, returning its id
    async fn submit(&self, request: &ConversionRequest) -> Result<String>;

    /// Current state of a conversion job
    async fn status(&self, job_id: &str) -> Result<ConversionState>;
}

/// Authentication status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    /// Whether authentication is valid
    pub authenticated: bool,

    /// Account information if available
    pub account_info: Option<String>,

    /// Error message if not authenticated
    pub error: Option<String>,
}

impl AuthStatus {
    pub fn ok(account_info: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            account_info: Some(account_info.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            account_info: None,
            error: Some(error.into()),
        }
    }
}

/// Image in the classic environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassicImage {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Number of block devices captured, one export file each
    pub volume_count: usize,
}

/// Instance in the classic environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassicInstance {
    pub id: String,
    pub name: String,
    pub status: RemoteStatus,
}

/// Object in staging storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredObject {
    pub name: String,
    pub size: u64,
}

/// Conversion job request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub bucket: String,
    /// Source objects, boot volume first
    pub objects: Vec<String>,
    /// Target image format (e.g. "qcow2")
    pub target_format: String,
}

/// Conversion job state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConversionState {
    Running,
    Succeeded { object: String },
    Failed { reason: String },
}
