//! In-memory implementation of every external capability
//!
//! Used by `vpcflowd simulate` and by the test suites. Long-running operations
//! stay in flight for `latency` status checks before they settle, so the
//! dispatch/poll split of the engine is exercised without a real provider.

use crate::error::{CloudError, Result};
use crate::provider::{
    AuthStatus, ClassicImage, ClassicInstance, ClassicProvider, CloudProvider, ConversionRequest,
    ConversionState, ImageConverter, ObjectStore, StoredObject,
};
use crate::resource::{RemoteResource, RemoteStatus, ResourceKind, ResourceSpec, Scope};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

const EXPORT_SUFFIX: &str = "vhd";

/// Deterministic in-memory cloud
pub struct MemoryCloud {
    latency: u32,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    resources: HashMap<String, TrackedResource>,
    revoked_accounts: HashSet<String>,
    failing_creates: HashSet<(ResourceKind, String)>,
    failing_updates: HashSet<(ResourceKind, String)>,

    classic_instances: HashMap<String, TrackedInstance>,
    failing_captures: HashSet<String>,
    unreachable: bool,
    images: HashMap<String, ClassicImage>,
    instance_transactions: HashMap<String, PendingCapture>,
    image_transactions: HashMap<String, PendingExport>,

    buckets: HashMap<String, BTreeMap<String, u64>>,

    conversions: HashMap<String, PendingConversion>,
    failing_conversions: bool,
}

struct TrackedResource {
    scope: Scope,
    remote: RemoteResource,
    remaining: u32,
}

struct TrackedInstance {
    instance: ClassicInstance,
    volume_count: usize,
    remaining: u32,
}

struct PendingCapture {
    transaction: String,
    image_name: String,
    volume_count: usize,
    remaining: u32,
}

struct PendingExport {
    transaction: String,
    bucket: String,
    prefix: String,
    volume_count: usize,
    remaining: u32,
}

struct PendingConversion {
    request: ConversionRequest,
    remaining: u32,
}

impl MemoryCloud {
    /// Operations settle after `latency` status checks
    pub fn new(latency: u32) -> Self {
        Self {
            latency,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a running classic instance that can be migrated
    pub fn add_classic_instance(&self, id: &str, name: &str, volume_count: usize) {
        let mut state = self.state();
        state.classic_instances.insert(
            id.to_string(),
            TrackedInstance {
                instance: ClassicInstance {
                    id: id.to_string(),
                    name: name.to_string(),
                    status: RemoteStatus::Running,
                },
                volume_count,
                remaining: 0,
            },
        );
    }

    /// Register an existing classic image
    pub fn add_classic_image(&self, id: &str, name: &str, volume_count: usize) {
        self.state().images.insert(
            id.to_string(),
            ClassicImage {
                id: id.to_string(),
                name: name.to_string(),
                created_at: Utc::now(),
                volume_count,
            },
        );
    }

    /// Seed a live VPC resource, as if created by an earlier run or by hand
    pub fn add_remote(&self, scope: &Scope, kind: ResourceKind, name: &str) -> String {
        let mut state = self.state();
        let id = state.allocate_id(kind.as_str());
        let mut remote = RemoteResource::new(&id, name, kind).with_status(settled_status(kind));
        remote.created_at = Some(Utc::now());
        state.resources.insert(
            id.clone(),
            TrackedResource {
                scope: scope.clone(),
                remote,
                remaining: 0,
            },
        );
        id
    }

    /// Make every capture of `instance_id` fail
    pub fn fail_capture(&self, instance_id: &str) {
        self.state().failing_captures.insert(instance_id.to_string());
    }

    /// Make creation of `kind` named `name` fail
    pub fn fail_create(&self, kind: ResourceKind, name: &str) {
        self.state()
            .failing_creates
            .insert((kind, name.to_string()));
    }

    /// Make updates of `kind` named `name` fail
    pub fn fail_update(&self, kind: ResourceKind, name: &str) {
        self.state()
            .failing_updates
            .insert((kind, name.to_string()));
    }

    /// Drop every injected failure
    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing_creates.clear();
        state.failing_updates.clear();
        state.failing_captures.clear();
        state.failing_conversions = false;
        state.unreachable = false;
    }

    /// Make every conversion job fail
    pub fn fail_conversions(&self) {
        self.state().failing_conversions = true;
    }

    /// Classic instances never answer on the network
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Invalidate credentials for an account
    pub fn revoke_account(&self, account: &str) {
        self.state().revoked_accounts.insert(account.to_string());
    }

    pub fn restore_account(&self, account: &str) {
        self.state().revoked_accounts.remove(account);
    }

    /// Names of live remote resources of one kind
    pub fn remote_names(&self, kind: ResourceKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .state()
            .resources
            .values()
            .filter(|r| r.remote.kind == kind)
            .map(|r| r.remote.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Whether a classic instance still exists
    pub fn has_classic_instance(&self, id: &str) -> bool {
        self.state().classic_instances.contains_key(id)
    }

    /// Objects currently stored in a bucket
    pub fn objects(&self, bucket: &str) -> Vec<String> {
        self.state()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn check_account(&self, state: &MemoryState, account: &str) -> Result<()> {
        if state.revoked_accounts.contains(account) {
            return Err(CloudError::Auth(format!("credentials for {account} are invalid")));
        }
        Ok(())
    }
}

impl MemoryState {
    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:04}", prefix, self.next_id)
    }

    fn finish_capture(&mut self, instance_id: &str) {
        if let Some(capture) = self.instance_transactions.remove(instance_id) {
            let id = self.allocate_id("img");
            self.images.insert(
                id.clone(),
                ClassicImage {
                    id,
                    name: capture.image_name,
                    created_at: Utc::now(),
                    volume_count: capture.volume_count,
                },
            );
        }
    }

    fn finish_export(&mut self, image_id: &str) {
        if let Some(export) = self.image_transactions.remove(image_id) {
            let bucket = self.buckets.entry(export.bucket).or_default();
            for n in 0..export.volume_count {
                bucket.insert(
                    format!("{}-{}.{}", export.prefix, n, EXPORT_SUFFIX),
                    1 << 30,
                );
            }
        }
    }
}

fn settled_status(kind: ResourceKind) -> RemoteStatus {
    match kind {
        ResourceKind::Instance => RemoteStatus::Running,
        _ => RemoteStatus::Available,
    }
}

fn server_attributes(kind: ResourceKind, id: &str) -> Vec<(&'static str, serde_json::Value)> {
    let mut attributes = vec![("crn", serde_json::json!(format!("crn:v1:vpc:{id}")))];
    match kind {
        ResourceKind::Instance => {
            attributes.push(("primary_ip", serde_json::json!("10.240.0.4")));
        }
        ResourceKind::SshKey => {
            attributes.push(("fingerprint", serde_json::json!(format!("SHA256:{id}"))));
        }
        ResourceKind::VpnGateway => {
            attributes.push(("public_ip", serde_json::json!("169.61.0.10")));
        }
        _ => {}
    }
    attributes
}

#[async_trait]
impl CloudProvider for MemoryCloud {
    fn name(&self) -> &str {
        "memory"
    }

    async fn check_auth(&self, scope: &Scope) -> Result<AuthStatus> {
        let state = self.state();
        if state.revoked_accounts.contains(&scope.account) {
            return Ok(AuthStatus::failed("credentials revoked"));
        }
        Ok(AuthStatus::ok(scope.account.clone()))
    }

    async fn find(
        &self,
        scope: &Scope,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Option<RemoteResource>> {
        let state = self.state();
        self.check_account(&state, &scope.account)?;
        Ok(state
            .resources
            .values()
            .find(|r| r.scope == *scope && r.remote.kind == kind && r.remote.name == name)
            .map(|r| r.remote.clone()))
    }

    async fn get(&self, scope: &Scope, kind: ResourceKind, id: &str) -> Result<RemoteResource> {
        let mut state = self.state();
        self.check_account(&state, &scope.account)?;
        let tracked = state
            .resources
            .get_mut(id)
            .filter(|r| r.remote.kind == kind)
            .ok_or_else(|| CloudError::NotFound(format!("{kind} {id}")))?;

        if tracked.remaining > 0 {
            tracked.remaining -= 1;
        } else if tracked.remote.status == RemoteStatus::Pending {
            tracked.remote.status = settled_status(kind);
        }
        Ok(tracked.remote.clone())
    }

    async fn list(&self, scope: &Scope, kind: ResourceKind) -> Result<Vec<RemoteResource>> {
        let state = self.state();
        self.check_account(&state, &scope.account)?;
        Ok(state
            .resources
            .values()
            .filter(|r| r.scope == *scope && r.remote.kind == kind)
            .map(|r| r.remote.clone())
            .collect())
    }

    async fn create(&self, scope: &Scope, spec: &ResourceSpec) -> Result<RemoteResource> {
        let mut state = self.state();
        self.check_account(&state, &scope.account)?;

        if state
            .failing_creates
            .contains(&(spec.kind, spec.name.clone()))
        {
            return Err(CloudError::Execute(format!(
                "{} {} rejected by provider",
                spec.kind, spec.name
            )));
        }
        if state
            .resources
            .values()
            .any(|r| r.scope == *scope && r.remote.kind == spec.kind && r.remote.name == spec.name)
        {
            return Err(CloudError::InvalidRequest(format!(
                "{} {} already exists",
                spec.kind, spec.name
            )));
        }

        let id = state.allocate_id(spec.kind.as_str());
        let mut remote = RemoteResource::new(&id, &spec.name, spec.kind);
        for (key, value) in server_attributes(spec.kind, &id) {
            remote.attributes.insert(key.to_string(), value);
        }
        remote.created_at = Some(Utc::now());
        remote.status = if self.latency == 0 {
            settled_status(spec.kind)
        } else {
            RemoteStatus::Pending
        };
        state.resources.insert(
            id.clone(),
            TrackedResource {
                scope: scope.clone(),
                remote,
                remaining: self.latency,
            },
        );

        tracing::debug!(
            kind = %spec.kind,
            name = %spec.name,
            id = %id,
            "memory cloud created resource"
        );
        // The creation response carries no server-assigned fields
        Ok(RemoteResource::new(id, &spec.name, spec.kind).with_status(RemoteStatus::Pending))
    }

    async fn update(&self, scope: &Scope, id: &str, spec: &ResourceSpec) -> Result<()> {
        let mut state = self.state();
        self.check_account(&state, &scope.account)?;
        if state
            .failing_updates
            .contains(&(spec.kind, spec.name.clone()))
        {
            return Err(CloudError::Execute(format!(
                "update of {} {} rejected by provider",
                spec.kind, spec.name
            )));
        }
        let tracked = state
            .resources
            .get_mut(id)
            .ok_or_else(|| CloudError::NotFound(format!("{} {}", spec.kind, id)))?;
        tracked.remote.name = spec.name.clone();
        tracked
            .remote
            .attributes
            .insert("config".to_string(), spec.config.clone());
        Ok(())
    }

    async fn delete(&self, scope: &Scope, kind: ResourceKind, id: &str) -> Result<()> {
        let mut state = self.state();
        self.check_account(&state, &scope.account)?;
        match state.resources.remove(id) {
            Some(_) => Ok(()),
            None => Err(CloudError::NotFound(format!("{kind} {id}"))),
        }
    }
}

#[async_trait]
impl ClassicProvider for MemoryCloud {
    async fn capture_image(
        &self,
        account: &str,
        instance_id: &str,
        image_name: &str,
    ) -> Result<()> {
        let mut state = self.state();
        self.check_account(&state, account)?;
        if state.failing_captures.contains(instance_id) {
            return Err(CloudError::Execute(format!(
                "image capture of {instance_id} failed"
            )));
        }
        let volume_count = state
            .classic_instances
            .get(instance_id)
            .map(|i| i.volume_count)
            .ok_or_else(|| CloudError::NotFound(format!("classic instance {instance_id}")))?;
        if state.instance_transactions.contains_key(instance_id) {
            return Err(CloudError::Execute(format!(
                "instance {instance_id} has an active transaction"
            )));
        }

        let transaction = state.allocate_id("txn");
        state.instance_transactions.insert(
            instance_id.to_string(),
            PendingCapture {
                transaction,
                image_name: image_name.to_string(),
                volume_count,
                remaining: self.latency,
            },
        );
        if self.latency == 0 {
            state.finish_capture(instance_id);
        }
        Ok(())
    }

    async fn instance_transaction(
        &self,
        account: &str,
        instance_id: &str,
    ) -> Result<Option<String>> {
        let mut state = self.state();
        self.check_account(&state, account)?;
        let Some(capture) = state.instance_transactions.get_mut(instance_id) else {
            return Ok(None);
        };
        if capture.remaining > 0 {
            capture.remaining -= 1;
            return Ok(Some(capture.transaction.clone()));
        }
        state.finish_capture(instance_id);
        Ok(None)
    }

    async fn find_images(&self, account: &str, name: &str) -> Result<Vec<ClassicImage>> {
        let state = self.state();
        self.check_account(&state, account)?;
        Ok(state
            .images
            .values()
            .filter(|i| i.name == name)
            .cloned()
            .collect())
    }

    async fn get_image(&self, account: &str, image_id: &str) -> Result<ClassicImage> {
        let state = self.state();
        self.check_account(&state, account)?;
        state
            .images
            .get(image_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("classic image {image_id}")))
    }

    async fn export_image(
        &self,
        account: &str,
        image_id: &str,
        bucket: &str,
        prefix: &str,
    ) -> Result<()> {
        let mut state = self.state();
        self.check_account(&state, account)?;
        let volume_count = state
            .images
            .get(image_id)
            .map(|i| i.volume_count)
            .ok_or_else(|| CloudError::NotFound(format!("classic image {image_id}")))?;

        let transaction = state.allocate_id("txn");
        state.image_transactions.insert(
            image_id.to_string(),
            PendingExport {
                transaction,
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                volume_count,
                remaining: self.latency,
            },
        );
        if self.latency == 0 {
            state.finish_export(image_id);
        }
        Ok(())
    }

    async fn image_transaction(&self, account: &str, image_id: &str) -> Result<Option<String>> {
        let mut state = self.state();
        self.check_account(&state, account)?;
        let Some(export) = state.image_transactions.get_mut(image_id) else {
            return Ok(None);
        };
        if export.remaining > 0 {
            export.remaining -= 1;
            return Ok(Some(export.transaction.clone()));
        }
        state.finish_export(image_id);
        Ok(None)
    }

    async fn create_instance(
        &self,
        account: &str,
        image_id: &str,
        name: &str,
        _user_data: &str,
    ) -> Result<ClassicInstance> {
        let mut state = self.state();
        self.check_account(&state, account)?;
        let volume_count = state
            .images
            .get(image_id)
            .map(|i| i.volume_count)
            .ok_or_else(|| CloudError::NotFound(format!("classic image {image_id}")))?;

        let id = state.allocate_id("cci");
        let instance = ClassicInstance {
            id: id.clone(),
            name: name.to_string(),
            status: if self.latency == 0 {
                RemoteStatus::Running
            } else {
                RemoteStatus::Pending
            },
        };
        state.classic_instances.insert(
            id,
            TrackedInstance {
                instance: instance.clone(),
                volume_count,
                remaining: self.latency,
            },
        );
        Ok(instance)
    }

    async fn get_instance(&self, account: &str, instance_id: &str) -> Result<ClassicInstance> {
        let mut state = self.state();
        self.check_account(&state, account)?;
        let tracked = state
            .classic_instances
            .get_mut(instance_id)
            .ok_or_else(|| CloudError::NotFound(format!("classic instance {instance_id}")))?;
        if tracked.remaining > 0 {
            tracked.remaining -= 1;
        } else if tracked.instance.status == RemoteStatus::Pending {
            tracked.instance.status = RemoteStatus::Running;
        }
        Ok(tracked.instance.clone())
    }

    async fn is_reachable(&self, account: &str, instance_id: &str) -> Result<bool> {
        let state = self.state();
        self.check_account(&state, account)?;
        let tracked = state
            .classic_instances
            .get(instance_id)
            .ok_or_else(|| CloudError::NotFound(format!("classic instance {instance_id}")))?;
        Ok(!state.unreachable && tracked.instance.status == RemoteStatus::Running)
    }

    async fn delete_instance(&self, account: &str, instance_id: &str) -> Result<()> {
        let mut state = self.state();
        self.check_account(&state, account)?;
        state
            .classic_instances
            .remove(instance_id)
            .map(|_| ())
            .ok_or_else(|| CloudError::NotFound(format!("classic instance {instance_id}")))
    }
}

#[async_trait]
impl ObjectStore for MemoryCloud {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<StoredObject>> {
        let state = self.state();
        Ok(state
            .buckets
            .get(bucket)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|(name, _)| name.starts_with(prefix))
                    .map(|(name, size)| StoredObject {
                        name: name.clone(),
                        size: *size,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_objects(&self, bucket: &str, names: &[String]) -> Result<()> {
        let mut state = self.state();
        if let Some(objects) = state.buckets.get_mut(bucket) {
            for name in names {
                objects.remove(name);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ImageConverter for MemoryCloud {
    async fn submit(&self, request: &ConversionRequest) -> Result<String> {
        let mut state = self.state();
        if request.objects.is_empty() {
            return Err(CloudError::InvalidRequest(
                "conversion needs at least one object".to_string(),
            ));
        }
        let id = state.allocate_id("conv");
        state.conversions.insert(
            id.clone(),
            PendingConversion {
                request: request.clone(),
                remaining: self.latency,
            },
        );
        Ok(id)
    }

    async fn status(&self, job_id: &str) -> Result<ConversionState> {
        let mut state = self.state();
        let failing = state.failing_conversions;
        let job = state
            .conversions
            .get_mut(job_id)
            .ok_or_else(|| CloudError::NotFound(format!("conversion {job_id}")))?;
        if job.remaining > 0 {
            job.remaining -= 1;
            return Ok(ConversionState::Running);
        }
        if failing {
            return Ok(ConversionState::Failed {
                reason: "qemu-img exited with status 1".to_string(),
            });
        }

        let source = job.request.objects[0].clone();
        let object = match source.rsplit_once('.') {
            Some((stem, _)) => format!("{stem}.{}", job.request.target_format),
            None => format!("{source}.{}", job.request.target_format),
        };
        let bucket = job.request.bucket.clone();
        state
            .buckets
            .entry(bucket)
            .or_default()
            .insert(object.clone(), 1 << 30);
        Ok(ConversionState::Succeeded { object })
    }
}
