//! Local resource records

use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;
use vpcflow_cloud::{ResourceKind, Scope};

/// Lifecycle status of a local resource record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    CreationPending,
    Creating,
    Created,
    UpdationPending,
    Deleting,
    Deleted,
    ErrorCreating,
    ErrorDeleting,
}

impl ResourceStatus {
    /// Whether `next` is a legal forward move from `self`
    pub fn can_transition_to(self, next: ResourceStatus) -> bool {
        use ResourceStatus::*;
        matches!(
            (self, next),
            (CreationPending, Creating)
                | (CreationPending, ErrorCreating)
                | (Creating, Created)
                | (Creating, ErrorCreating)
                | (Created, UpdationPending)
                | (Created, Deleting)
                | (UpdationPending, Created)
                | (UpdationPending, ErrorCreating)
                | (Deleting, Deleted)
                | (Deleting, ErrorDeleting)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResourceStatus::Deleted | ResourceStatus::ErrorCreating | ResourceStatus::ErrorDeleting
        )
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            ResourceStatus::ErrorCreating | ResourceStatus::ErrorDeleting
        )
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceStatus::CreationPending => "CREATION_PENDING",
            ResourceStatus::Creating => "CREATING",
            ResourceStatus::Created => "CREATED",
            ResourceStatus::UpdationPending => "UPDATION_PENDING",
            ResourceStatus::Deleting => "DELETING",
            ResourceStatus::Deleted => "DELETED",
            ResourceStatus::ErrorCreating => "ERROR_CREATING",
            ResourceStatus::ErrorDeleting => "ERROR_DELETING",
        };
        f.write_str(s)
    }
}

/// One VPC resource as tracked locally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: Uuid,
    pub kind: ResourceKind,
    pub scope: Scope,
    pub name: String,
    pub status: ResourceStatus,

    /// Provider id, known once created
    pub remote_id: Option<String>,

    /// Local ids of referenced records, keyed by role
    pub references: BTreeMap<String, Uuid>,

    /// Provider-specific configuration
    pub config: serde_json::Value,

    /// Server-assigned attributes (IP, fingerprint, ...)
    pub attributes: HashMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn builder(kind: ResourceKind, scope: Scope, name: impl Into<String>) -> ResourceBuilder {
        ResourceBuilder {
            kind,
            scope,
            name: name.into(),
            references: BTreeMap::new(),
            config: serde_json::Value::Null,
        }
    }

    /// Move the record forward along its lifecycle
    pub fn transition(&mut self, next: ResourceStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                record: format!("{} {}", self.kind, self.name),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Live for uniqueness purposes. A record whose create failed gives its
    /// name up so a retry can issue a fresh record.
    pub fn is_live(&self) -> bool {
        !matches!(
            self.status,
            ResourceStatus::Deleted | ResourceStatus::ErrorCreating
        )
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
        self.updated_at = Utc::now();
    }
}

/// Builds a fresh CREATION_PENDING record.
///
/// Records are never cloned from a template and re-attached; every new
/// record goes through this builder with its references spelled out.
#[derive(Debug, Clone)]
pub struct ResourceBuilder {
    kind: ResourceKind,
    scope: Scope,
    name: String,
    references: BTreeMap<String, Uuid>,
    config: serde_json::Value,
}

impl ResourceBuilder {
    pub fn reference(mut self, role: impl Into<String>, id: Uuid) -> Self {
        self.references.insert(role.into(), id);
        self
    }

    pub fn config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ResourceRecord {
        let now = Utc::now();
        ResourceRecord {
            id: Uuid::new_v4(),
            kind: self.kind,
            scope: self.scope,
            name: self.name,
            status: ResourceStatus::CreationPending,
            remote_id: None,
            references: self.references,
            config: self.config,
            attributes: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet() -> ResourceRecord {
        ResourceRecord::builder(ResourceKind::Subnet, Scope::new("acct", "us-south"), "web")
            .reference("network", Uuid::new_v4())
            .config(serde_json::json!({"cidr": "10.0.1.0/24"}))
            .build()
    }

    #[test]
    fn test_builder_starts_pending() {
        let record = subnet();
        assert_eq!(record.status, ResourceStatus::CreationPending);
        assert!(record.remote_id.is_none());
        assert!(record.references.contains_key("network"));
    }

    #[test]
    fn test_forward_lifecycle() {
        let mut record = subnet();
        record.transition(ResourceStatus::Creating).unwrap();
        record.transition(ResourceStatus::Created).unwrap();
        record.transition(ResourceStatus::Deleting).unwrap();
        record.transition(ResourceStatus::Deleted).unwrap();
        assert!(!record.is_live());
    }

    #[test]
    fn test_error_is_terminal() {
        let mut record = subnet();
        record.transition(ResourceStatus::Creating).unwrap();
        record.transition(ResourceStatus::ErrorCreating).unwrap();

        let err = record.transition(ResourceStatus::Creating).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(record.status, ResourceStatus::ErrorCreating);
        assert!(!record.is_live());
    }

    #[test]
    fn test_failed_delete_keeps_name() {
        let mut record = subnet();
        record.transition(ResourceStatus::Creating).unwrap();
        record.transition(ResourceStatus::Created).unwrap();
        record.transition(ResourceStatus::Deleting).unwrap();
        record.transition(ResourceStatus::ErrorDeleting).unwrap();
        assert!(record.is_live());
    }

    #[test]
    fn test_no_backward_move() {
        let mut record = subnet();
        record.transition(ResourceStatus::Creating).unwrap();
        record.transition(ResourceStatus::Created).unwrap();
        assert!(record.transition(ResourceStatus::CreationPending).is_err());
    }
}
