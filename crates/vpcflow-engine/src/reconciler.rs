//! Resource reconciler
//!
//! Idempotent create/update/delete of one resource record against the VPC
//! provider. A create is always preceded by a remote name check, and a remote
//! object that already carries the name is reported as a conflict rather than
//! adopted.

use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vpcflow_cloud::{CloudError, RemoteResource, ResourceKind, ResourceSpec, Scope};
use vpcflow_core::{ResourceRecord, ResourceStatus};

const CREATE_REQUESTED_AT: &str = "create_requested_at";

/// Outcome of a remote name check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Absent,
    /// Remote id of the object already using the name
    Conflict(String),
}

pub struct Reconciler {
    ctx: Arc<EngineContext>,
}

impl Reconciler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn validate(
        &self,
        kind: ResourceKind,
        scope: &Scope,
        name: &str,
    ) -> Result<Validation> {
        self.ctx.accounts.ensure_valid(&scope.account)?;
        let found = self
            .ctx
            .provider
            .find(scope, kind, name)
            .await
            .map_err(|e| self.observe(scope, e))?;

        Ok(match found {
            Some(remote) => Validation::Conflict(remote.id),
            None => Validation::Absent,
        })
    }

    /// Create the remote object for a record. A record already CREATING is an
    /// interrupted earlier attempt: the object it may have produced is picked
    /// up instead of requesting a second one.
    pub async fn create(&self, resource_id: Uuid) -> Result<RemoteResource> {
        let mut record = self.ctx.resources.get_resource(resource_id)?;
        self.ctx.accounts.ensure_valid(&record.scope.account)?;

        let adopted = if record.status == ResourceStatus::Creating {
            self.find_interrupted_create(&mut record).await?
        } else {
            if let Validation::Conflict(remote_id) =
                self.validate(record.kind, &record.scope, &record.name).await?
            {
                self.mark(&mut record, ResourceStatus::ErrorCreating)?;
                return Err(EngineError::Conflict {
                    kind: record.kind,
                    name: record.name,
                    remote_id,
                });
            }
            None
        };

        let created = match adopted {
            Some(remote) => remote,
            None => self.request_create(&mut record).await?,
        };

        // The create response is partial; the id alone is trusted
        let remote = self
            .ctx
            .provider
            .get(&record.scope, record.kind, &created.id)
            .await
            .map_err(|e| self.observe(&record.scope, e))?;

        record.remote_id = Some(remote.id.clone());
        for (key, value) in &remote.attributes {
            record.set_attribute(key.clone(), value.clone());
        }
        record.set_attribute("remote_status", serde_json::json!(remote.status.to_string()));
        self.mark(&mut record, ResourceStatus::Created)?;

        info!(kind = %record.kind, name = %record.name, remote_id = %remote.id, "Resource created");
        Ok(remote)
    }

    async fn request_create(&self, record: &mut ResourceRecord) -> Result<RemoteResource> {
        let spec = match build_spec(&self.ctx, record) {
            Ok(spec) => spec,
            Err(e) => {
                self.mark(record, ResourceStatus::ErrorCreating)?;
                return Err(e);
            }
        };

        if record.status == ResourceStatus::CreationPending {
            record.transition(ResourceStatus::Creating)?;
        }
        record.set_attribute(CREATE_REQUESTED_AT, serde_json::json!(Utc::now()));
        self.ctx.resources.update_resource(record)?;

        match self.ctx.provider.create(&record.scope, &spec).await {
            Ok(created) => {
                debug!(
                    kind = %record.kind,
                    name = %record.name,
                    id = %created.id,
                    "Create accepted"
                );
                Ok(created)
            }
            Err(e) => {
                // A dropped connection leaves the remote outcome unknown
                if !e.is_retryable() {
                    self.mark(record, ResourceStatus::ErrorCreating)?;
                }
                Err(self.observe(&record.scope, e))
            }
        }
    }

    /// Remote object left by an interrupted create of this record. Matched by
    /// name and a creation time no earlier than our request; anything older
    /// belongs to someone else.
    async fn find_interrupted_create(
        &self,
        record: &mut ResourceRecord,
    ) -> Result<Option<RemoteResource>> {
        let found = self
            .ctx
            .provider
            .find(&record.scope, record.kind, &record.name)
            .await
            .map_err(|e| self.observe(&record.scope, e))?;
        let Some(remote) = found else {
            debug!(
                kind = %record.kind,
                name = %record.name,
                "Interrupted create left nothing behind"
            );
            return Ok(None);
        };

        let requested_at = record
            .attributes
            .get(CREATE_REQUESTED_AT)
            .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok());
        let ours = matches!(
            (requested_at, remote.created_at),
            (Some(requested), Some(created)) if created >= requested
        );
        if !ours {
            self.mark(record, ResourceStatus::ErrorCreating)?;
            return Err(EngineError::Conflict {
                kind: record.kind,
                name: record.name.clone(),
                remote_id: remote.id,
            });
        }
        info!(
            kind = %record.kind,
            name = %record.name,
            id = %remote.id,
            "Picking up interrupted create"
        );
        Ok(Some(remote))
    }

    /// Apply `config` to an existing resource
    pub async fn update(&self, resource_id: Uuid, config: &serde_json::Value) -> Result<()> {
        let mut record = self.ctx.resources.get_resource(resource_id)?;
        self.ctx.accounts.ensure_valid(&record.scope.account)?;
        let remote_id = remote_id_of(&record)?;

        let mut desired = record.clone();
        desired.config = config.clone();
        let spec = build_spec(&self.ctx, &desired)?;
        self.mark(&mut record, ResourceStatus::UpdationPending)?;

        if let Err(e) = self.ctx.provider.update(&record.scope, &remote_id, &spec).await {
            if !e.is_retryable() {
                self.mark(&mut record, ResourceStatus::ErrorCreating)?;
            }
            return Err(self.observe(&record.scope, e));
        }
        record.config = desired.config;
        self.mark(&mut record, ResourceStatus::Created)?;

        info!(kind = %record.kind, name = %record.name, "Resource updated");
        Ok(())
    }

    pub async fn delete(&self, resource_id: Uuid) -> Result<()> {
        let mut record = self.ctx.resources.get_resource(resource_id)?;
        self.ctx.accounts.ensure_valid(&record.scope.account)?;
        let remote_id = remote_id_of(&record)?;

        self.mark(&mut record, ResourceStatus::Deleting)?;
        match self
            .ctx
            .provider
            .delete(&record.scope, record.kind, &remote_id)
            .await
        {
            Ok(()) => {}
            Err(CloudError::NotFound(_)) => {
                warn!(kind = %record.kind, name = %record.name, "Remote object already gone");
            }
            Err(e) => {
                if !e.is_retryable() {
                    self.mark(&mut record, ResourceStatus::ErrorDeleting)?;
                }
                return Err(self.observe(&record.scope, e));
            }
        }
        self.mark(&mut record, ResourceStatus::Deleted)?;

        info!(kind = %record.kind, name = %record.name, "Resource deleted");
        Ok(())
    }

    /// Record an error status for a resource that never reached the provider
    pub fn abandon(&self, resource_id: Uuid) -> Result<()> {
        let mut record = self.ctx.resources.get_resource(resource_id)?;
        if record.status.can_transition_to(ResourceStatus::ErrorCreating) {
            self.mark(&mut record, ResourceStatus::ErrorCreating)?;
        }
        Ok(())
    }

    fn mark(&self, record: &mut ResourceRecord, status: ResourceStatus) -> Result<()> {
        record.transition(status)?;
        self.ctx.resources.update_resource(record)?;
        Ok(())
    }

    fn observe(&self, scope: &Scope, error: CloudError) -> EngineError {
        self.ctx.accounts.observe(&scope.account, &error);
        EngineError::Cloud(error)
    }
}

fn remote_id_of(record: &ResourceRecord) -> Result<String> {
    record.remote_id.clone().ok_or_else(|| {
        EngineError::Validation(format!("{} '{}' has no remote id", record.kind, record.name))
    })
}

/// Provider request for a record, with references translated to remote ids
pub fn build_spec(ctx: &EngineContext, record: &ResourceRecord) -> Result<ResourceSpec> {
    let mut spec = ResourceSpec::new(record.kind, &record.name, record.config.clone());
    for (role, reference_id) in &record.references {
        let target = ctx.resources.get_resource(*reference_id)?;
        let remote_id = target.remote_id.ok_or_else(|| {
            EngineError::Validation(format!(
                "{} '{}' referenced as {} has not been created",
                target.kind, target.name, role
            ))
        })?;
        spec = spec.with_reference(role.clone(), remote_id);
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpcflow_cloud::{CloudProvider, MemoryCloud};
    use vpcflow_config::EngineConfig;
    use vpcflow_core::{MemoryStore, ResourceRepository};

    fn scope() -> Scope {
        Scope::new("acct-1", "us-south")
    }

    fn setup() -> (Arc<MemoryCloud>, Arc<MemoryStore>, Reconciler) {
        let cloud = Arc::new(MemoryCloud::new(1));
        let store = Arc::new(MemoryStore::new());
        let ctx = EngineContext::in_memory(cloud.clone(), store.clone(), EngineConfig::default());
        (cloud, store, Reconciler::new(Arc::new(ctx)))
    }

    fn insert(store: &MemoryStore, record: ResourceRecord) -> Uuid {
        let id = record.id;
        store.insert_resource(record).unwrap();
        id
    }

    #[tokio::test]
    async fn test_create_refetches_server_attributes() {
        let (_cloud, store, reconciler) = setup();
        let id = insert(
            &store,
            ResourceRecord::builder(ResourceKind::SshKey, scope(), "ops").build(),
        );

        let remote = reconciler.create(id).await.unwrap();
        let record = store.get_resource(id).unwrap();
        assert_eq!(record.status, ResourceStatus::Created);
        assert_eq!(record.remote_id.as_deref(), Some(remote.id.as_str()));
        assert!(record.attributes.contains_key("fingerprint"));
    }

    #[tokio::test]
    async fn test_remote_name_clash_is_a_conflict() {
        let (cloud, store, reconciler) = setup();
        let existing = cloud.add_remote(&scope(), ResourceKind::Network, "vpc-a");
        let id = insert(
            &store,
            ResourceRecord::builder(ResourceKind::Network, scope(), "vpc-a").build(),
        );

        let err = reconciler.create(id).await.unwrap_err();
        match err {
            EngineError::Conflict { remote_id, .. } => assert_eq!(remote_id, existing),
            other => panic!("expected conflict, got {other}"),
        }
        assert_eq!(
            store.get_resource(id).unwrap().status,
            ResourceStatus::ErrorCreating
        );
        // never adopted
        assert!(store.get_resource(id).unwrap().remote_id.is_none());
    }

    #[tokio::test]
    async fn test_execute_error_marks_error_creating() {
        let (cloud, store, reconciler) = setup();
        cloud.fail_create(ResourceKind::Volume, "data");
        let id = insert(
            &store,
            ResourceRecord::builder(ResourceKind::Volume, scope(), "data").build(),
        );

        let err = reconciler.create(id).await.unwrap_err();
        assert!(err.is_execute());
        assert_eq!(
            store.get_resource(id).unwrap().status,
            ResourceStatus::ErrorCreating
        );
    }

    #[tokio::test]
    async fn test_references_resolve_to_remote_ids() {
        let (_cloud, store, reconciler) = setup();
        let network = insert(
            &store,
            ResourceRecord::builder(ResourceKind::Network, scope(), "vpc-a").build(),
        );
        let subnet = insert(
            &store,
            ResourceRecord::builder(ResourceKind::Subnet, scope(), "subnet-a")
                .reference("network", network)
                .build(),
        );

        // the network has no remote id yet
        assert!(reconciler.create(subnet).await.is_err());

        let remote = reconciler.create(network).await.unwrap();
        let record = store.get_resource(network).unwrap();
        let spec = build_spec(&reconciler.ctx, &store.get_resource(subnet).unwrap()).unwrap();
        assert_eq!(spec.references.get("network"), Some(&remote.id));
        assert_eq!(record.status, ResourceStatus::Created);
    }

    #[tokio::test]
    async fn test_delete_after_create() {
        let (cloud, store, reconciler) = setup();
        let id = insert(
            &store,
            ResourceRecord::builder(ResourceKind::AddressPrefix, scope(), "prefix-a").build(),
        );
        reconciler.create(id).await.unwrap();
        reconciler.delete(id).await.unwrap();

        assert_eq!(store.get_resource(id).unwrap().status, ResourceStatus::Deleted);
        assert!(cloud.remote_names(ResourceKind::AddressPrefix).is_empty());
    }

    /// Record left CREATING by an attempt that asked the provider at `requested_at`
    fn interrupted(kind: ResourceKind, name: &str, requested_at: DateTime<Utc>) -> ResourceRecord {
        let mut record = ResourceRecord::builder(kind, scope(), name).build();
        record.transition(ResourceStatus::Creating).unwrap();
        record.set_attribute(CREATE_REQUESTED_AT, serde_json::json!(requested_at));
        record
    }

    #[tokio::test]
    async fn test_interrupted_create_without_remote_is_requested_again() {
        let (cloud, store, reconciler) = setup();
        let id = insert(
            &store,
            interrupted(ResourceKind::Network, "vpc-a", Utc::now()),
        );

        let remote = reconciler.create(id).await.unwrap();
        let record = store.get_resource(id).unwrap();
        assert_eq!(record.status, ResourceStatus::Created);
        assert_eq!(record.remote_id.as_deref(), Some(remote.id.as_str()));
        assert_eq!(cloud.remote_names(ResourceKind::Network), vec!["vpc-a"]);
    }

    #[tokio::test]
    async fn test_interrupted_create_picks_up_its_remote() {
        let (cloud, store, reconciler) = setup();
        let id = insert(
            &store,
            interrupted(
                ResourceKind::Network,
                "vpc-a",
                Utc::now() - chrono::Duration::seconds(5),
            ),
        );
        // the provider finished the lost request
        let remote_id = cloud.add_remote(&scope(), ResourceKind::Network, "vpc-a");

        let remote = reconciler.create(id).await.unwrap();
        assert_eq!(remote.id, remote_id);
        assert_eq!(
            store.get_resource(id).unwrap().remote_id.as_deref(),
            Some(remote_id.as_str())
        );
        assert_eq!(cloud.remote_names(ResourceKind::Network), vec!["vpc-a"]);
    }

    #[tokio::test]
    async fn test_interrupted_create_rejects_older_remote() {
        let (cloud, store, reconciler) = setup();
        let existing = cloud.add_remote(&scope(), ResourceKind::Network, "vpc-a");
        let id = insert(
            &store,
            interrupted(
                ResourceKind::Network,
                "vpc-a",
                Utc::now() + chrono::Duration::seconds(5),
            ),
        );

        match reconciler.create(id).await.unwrap_err() {
            EngineError::Conflict { remote_id, .. } => assert_eq!(remote_id, existing),
            other => panic!("expected conflict, got {other}"),
        }
        let record = store.get_resource(id).unwrap();
        assert_eq!(record.status, ResourceStatus::ErrorCreating);
        assert!(record.remote_id.is_none());
    }

    #[tokio::test]
    async fn test_update_applies_config() {
        let (cloud, store, reconciler) = setup();
        let id = insert(
            &store,
            ResourceRecord::builder(ResourceKind::SecurityGroup, scope(), "web").build(),
        );
        reconciler.create(id).await.unwrap();

        let config = serde_json::json!({"rules": [{"port": 443}]});
        reconciler.update(id, &config).await.unwrap();

        let record = store.get_resource(id).unwrap();
        assert_eq!(record.status, ResourceStatus::Created);
        assert_eq!(record.config, config);
        let remote = cloud
            .find(&scope(), ResourceKind::SecurityGroup, "web")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(remote.attributes.get("config"), Some(&config));
    }

    #[tokio::test]
    async fn test_update_failure_marks_error_creating() {
        let (cloud, store, reconciler) = setup();
        let id = insert(
            &store,
            ResourceRecord::builder(ResourceKind::SecurityGroup, scope(), "web").build(),
        );
        reconciler.create(id).await.unwrap();
        cloud.fail_update(ResourceKind::SecurityGroup, "web");

        let err = reconciler
            .update(id, &serde_json::json!({"rules": []}))
            .await
            .unwrap_err();
        assert!(err.is_execute());
        let record = store.get_resource(id).unwrap();
        assert_eq!(record.status, ResourceStatus::ErrorCreating);
        assert!(record.config.is_null());
    }

    #[tokio::test]
    async fn test_update_requires_created_resource() {
        let (_cloud, store, reconciler) = setup();
        let id = insert(
            &store,
            ResourceRecord::builder(ResourceKind::SecurityGroup, scope(), "web").build(),
        );
        assert!(reconciler.update(id, &serde_json::json!({})).await.is_err());
        assert_eq!(
            store.get_resource(id).unwrap().status,
            ResourceStatus::CreationPending
        );
    }

    #[tokio::test]
    async fn test_auth_failure_invalidates_account() {
        let (cloud, store, reconciler) = setup();
        cloud.revoke_account("acct-1");
        let id = insert(
            &store,
            ResourceRecord::builder(ResourceKind::Network, scope(), "vpc-a").build(),
        );

        assert!(reconciler.create(id).await.unwrap_err().is_auth());
        assert!(reconciler.ctx.accounts.is_invalid("acct-1"));
    }
}
