//! Migration step records
//!
//! One [`MigrationStepRecord`] tracks a classic workload through the image
//! pipeline. `in_focus` says which half of the current stage runs next and
//! the [`Lease`] says who is running it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stage of the classic → VPC image pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStage {
    TakeSnapshot,
    UploadToCos,
    ImageConversion,
    CreateCustomImage,
    CreateVsi,
}

impl MigrationStage {
    pub const ALL: [MigrationStage; 5] = [
        MigrationStage::TakeSnapshot,
        MigrationStage::UploadToCos,
        MigrationStage::ImageConversion,
        MigrationStage::CreateCustomImage,
        MigrationStage::CreateVsi,
    ];

    pub fn next(self) -> Option<MigrationStage> {
        match self {
            MigrationStage::TakeSnapshot => Some(MigrationStage::UploadToCos),
            MigrationStage::UploadToCos => Some(MigrationStage::ImageConversion),
            MigrationStage::ImageConversion => Some(MigrationStage::CreateCustomImage),
            MigrationStage::CreateCustomImage => Some(MigrationStage::CreateVsi),
            MigrationStage::CreateVsi => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStage::TakeSnapshot => "TAKE_SNAPSHOT",
            MigrationStage::UploadToCos => "UPLOAD_TO_COS",
            MigrationStage::ImageConversion => "IMAGE_CONVERSION",
            MigrationStage::CreateCustomImage => "CREATE_CUSTOM_IMAGE",
            MigrationStage::CreateVsi => "CREATE_VSI",
        }
    }
}

impl std::fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    InProgress,
    Success,
    Failed,
}

impl MigrationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, MigrationStatus::InProgress)
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::InProgress => write!(f, "IN_PROGRESS"),
            MigrationStatus::Success => write!(f, "SUCCESS"),
            MigrationStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Half of a stage: issue the long-running operation, or check on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Dispatch,
    Poll,
}

impl Phase {
    pub fn from_in_focus(in_focus: bool) -> Self {
        if in_focus { Phase::Dispatch } else { Phase::Poll }
    }

    pub fn in_focus(self) -> bool {
        self == Phase::Dispatch
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Dispatch => write!(f, "dispatch"),
            Phase::Poll => write!(f, "poll"),
        }
    }
}

/// Exclusive, expiring ownership of a migration record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(owner: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            owner: owner.into(),
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Steps of the Windows pre-migration backup sub-flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStep {
    Capture,
    SpinUp,
    AwaitReachable,
}

impl BackupStep {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupStep::Capture => "BACKUP_CAPTURE",
            BackupStep::SpinUp => "BACKUP_SPIN_UP",
            BackupStep::AwaitReachable => "BACKUP_AWAIT_REACHABLE",
        }
    }
}

/// State carried across steps by the backup sub-flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupState {
    pub step: BackupStep,
    /// Instance the backup was taken from
    pub source_instance_id: String,
    pub image_name: Option<String>,
    pub requested_at: Option<DateTime<Utc>>,
    pub image_id: Option<String>,
    /// Temporary backup instance
    pub instance_id: Option<String>,
    pub reachability_attempts: u32,
    pub complete: bool,
    /// Temporary instance has been deleted
    pub cleaned_up: bool,
}

impl BackupState {
    pub fn new(source_instance_id: impl Into<String>) -> Self {
        Self {
            step: BackupStep::Capture,
            source_instance_id: source_instance_id.into(),
            image_name: None,
            requested_at: None,
            image_id: None,
            instance_id: None,
            reachability_attempts: 0,
            complete: false,
            cleaned_up: false,
        }
    }
}

/// What the next handler invocation for a record acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Backup(BackupStep),
    Stage(MigrationStage),
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Backup(step) => step.as_str(),
            StepKind::Stage(stage) => stage.as_str(),
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable per-workload migration state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStepRecord {
    pub id: Uuid,
    /// Instance resource record being migrated
    pub resource_id: Uuid,
    /// Task record that owns this migration
    pub task_id: Uuid,

    pub stage: MigrationStage,
    pub status: MigrationStatus,
    /// true: dispatch half runs next; false: waiting, safe to poll
    pub in_focus: bool,
    pub lease: Option<Lease>,

    pub classic_account: String,
    pub classic_instance_id: Option<String>,
    pub classic_image_id: Option<String>,
    pub classic_image_name: Option<String>,
    pub snapshot_requested_at: Option<DateTime<Utc>>,

    pub bucket: String,
    pub object_prefix: Option<String>,
    pub volume_count: Option<usize>,

    /// Image-conversion sub-record
    pub conversion_id: Option<Uuid>,
    pub converted_object: Option<String>,
    pub custom_image_id: Option<String>,
    pub vpc_instance_id: Option<String>,

    pub backup: Option<BackupState>,

    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationStepRecord {
    pub fn new(
        resource_id: Uuid,
        task_id: Uuid,
        classic_account: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            resource_id,
            task_id,
            stage: MigrationStage::TakeSnapshot,
            status: MigrationStatus::InProgress,
            in_focus: true,
            lease: None,
            classic_account: classic_account.into(),
            classic_instance_id: None,
            classic_image_id: None,
            classic_image_name: None,
            snapshot_requested_at: None,
            bucket: bucket.into(),
            object_prefix: None,
            volume_count: None,
            conversion_id: None,
            converted_object: None,
            custom_image_id: None,
            vpc_instance_id: None,
            backup: None,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_in_focus(self.in_focus)
    }

    /// Backup sub-flow steps take precedence while it is incomplete
    pub fn kind(&self) -> StepKind {
        match &self.backup {
            Some(backup) if self.stage == MigrationStage::TakeSnapshot && !backup.complete => {
                StepKind::Backup(backup.step)
            }
            _ => StepKind::Stage(self.stage),
        }
    }

    /// Nobody holds a live lease
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == MigrationStatus::InProgress
            && self.lease.as_ref().is_none_or(|lease| lease.is_expired(now))
    }

    pub fn held_by(&self, owner: &str) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.owner == owner)
    }

    /// Dispatch finished; the poll half runs next
    pub fn await_completion(&mut self) {
        self.in_focus = false;
        self.touch();
    }

    /// Poll finished; move to the next stage's dispatch half
    pub fn advance(&mut self) {
        if let Some(next) = self.stage.next() {
            self.stage = next;
        }
        self.in_focus = true;
        self.touch();
    }

    /// Poll finished without leaving the stage (backup sub-steps)
    pub fn refocus(&mut self) {
        self.in_focus = true;
        self.touch();
    }

    pub fn succeed(&mut self) {
        self.status = MigrationStatus::Success;
        self.touch();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = MigrationStatus::Failed;
        self.message = Some(message.into());
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Image-conversion sub-task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRecord {
    pub id: Uuid,
    pub step_id: Uuid,
    /// Converter job id
    pub job_id: String,
    pub bucket: String,
    pub objects: Vec<String>,
    pub converted_object: Option<String>,
    pub status: MigrationStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversionRecord {
    pub fn new(
        step_id: Uuid,
        job_id: impl Into<String>,
        bucket: impl Into<String>,
        objects: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            step_id,
            job_id: job_id.into(),
            bucket: bucket.into(),
            objects,
            converted_object: None,
            status: MigrationStatus::InProgress,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step() -> MigrationStepRecord {
        MigrationStepRecord::new(Uuid::new_v4(), Uuid::new_v4(), "acct", "staging")
    }

    #[test]
    fn test_stage_order() {
        let mut stage = MigrationStage::TakeSnapshot;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen, MigrationStage::ALL.to_vec());
    }

    #[test]
    fn test_dispatch_then_poll_then_advance() {
        let mut step = step();
        assert_eq!(step.phase(), Phase::Dispatch);
        step.await_completion();
        assert_eq!(step.phase(), Phase::Poll);
        step.advance();
        assert_eq!(step.stage, MigrationStage::UploadToCos);
        assert_eq!(step.phase(), Phase::Dispatch);
    }

    #[test]
    fn test_backup_kind_precedes_snapshot() {
        let mut step = step();
        step.backup = Some(BackupState::new("cci-1"));
        assert_eq!(step.kind(), StepKind::Backup(BackupStep::Capture));

        if let Some(backup) = step.backup.as_mut() {
            backup.complete = true;
        }
        assert_eq!(step.kind(), StepKind::Stage(MigrationStage::TakeSnapshot));
    }

    #[test]
    fn test_lease_expiry_makes_record_claimable() {
        let now = Utc::now();
        let mut step = step();
        step.lease = Some(Lease::new("worker-a", now, Duration::seconds(30)));
        assert!(!step.is_claimable(now));
        assert!(step.is_claimable(now + Duration::seconds(31)));
        assert!(step.held_by("worker-a"));
        assert!(!step.held_by("worker-b"));
    }
}
