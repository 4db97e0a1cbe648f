//! Recovery sweeper
//!
//! Periodically picks up in-progress migration records nobody is working
//! on and re-enters the state machine for them. Poll halves are resumed
//! whenever the lease is free; dispatch halves only once their lease has
//! expired, or when the record has sat unclaimed for a whole lease TTL.

use crate::context::EngineContext;
use crate::error::Result;
use crate::migration::{MigrationDriver, StepProgress};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use vpcflow_core::{MigrationStepRecord, Phase};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Claimable records seen
    pub examined: usize,
    /// Records a handler ran for
    pub resumed: usize,
    /// Records that reached a terminal status during this sweep
    pub finished: usize,
}

pub struct Sweeper {
    ctx: Arc<EngineContext>,
    driver: Arc<MigrationDriver>,
}

/// Half to resume for a claimable record, if any
fn resumable(step: &MigrationStepRecord, now: DateTime<Utc>, ttl: ChronoDuration) -> Option<Phase> {
    match step.phase() {
        Phase::Poll => Some(Phase::Poll),
        Phase::Dispatch => match &step.lease {
            Some(lease) if lease.is_expired(now) => Some(Phase::Dispatch),
            None if step.updated_at + ttl <= now => Some(Phase::Dispatch),
            _ => None,
        },
    }
}

impl Sweeper {
    pub fn new(ctx: Arc<EngineContext>, driver: Arc<MigrationDriver>) -> Self {
        Self { ctx, driver }
    }

    /// One pass over every claimable record
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        let ttl = self.ctx.lease_ttl();
        let candidates = self.ctx.migrations.claimable_steps(now)?;
        let mut summary = SweepSummary {
            examined: candidates.len(),
            ..SweepSummary::default()
        };

        for step in candidates {
            let Some(phase) = resumable(&step, now, ttl) else {
                continue;
            };
            debug!(step_id = %step.id, stage = %step.stage, phase = %phase, "Resuming migration");

            match self.driver.resume(step.id, phase, "sweeper").await {
                Ok(StepProgress::Ran { step, .. }) => {
                    summary.resumed += 1;
                    if step.status.is_terminal() {
                        summary.finished += 1;
                    }
                }
                Ok(StepProgress::LeaseLost) => {
                    summary.resumed += 1;
                }
                Ok(StepProgress::NotClaimed) => {}
                Err(e) => warn!(step_id = %step.id, error = %e, "Resume failed"),
            }
        }

        if summary.resumed > 0 {
            info!(
                examined = summary.examined,
                resumed = summary.resumed,
                finished = summary.finished,
                "Sweep finished"
            );
        }
        Ok(summary)
    }

    /// Sweep every `sweep_interval` until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.ctx.config.sweep_interval().max(MIN_SWEEP_INTERVAL);
        info!(interval_ms = period.as_millis() as u64, "Starting recovery sweeper");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        error!(error = %e, "Sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Recovery sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run the sweeper on its own task
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { self.run(shutdown_rx).await });
        SweeperHandle { shutdown_tx, handle }
    }
}

pub struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Recovery sweeper task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{ClassicSource, MigrationPlan};
    use uuid::Uuid;
    use vpcflow_cloud::{MemoryCloud, ResourceKind, Scope};
    use vpcflow_config::EngineConfig;
    use vpcflow_core::{
        MemoryStore, MigrationRepository, MigrationStatus, ResourceRecord,
        ResourceRepository, TaskAction, TaskPhase, TaskRecord, TaskRepository,
    };

    struct Fixture {
        store: Arc<MemoryStore>,
        driver: Arc<MigrationDriver>,
        sweeper: Sweeper,
        task: TaskRecord,
    }

    fn fixture(latency: u32) -> Fixture {
        let cloud = Arc::new(MemoryCloud::new(latency));
        let store = Arc::new(MemoryStore::new());
        let config = EngineConfig {
            poll_interval_secs: 0,
            sweep_interval_secs: 0,
            lease_ttl_secs: 60,
            ..EngineConfig::default()
        };
        let ctx = Arc::new(EngineContext::in_memory(cloud.clone(), store.clone(), config));
        let driver = Arc::new(MigrationDriver::standard(ctx.clone()));

        let record = ResourceRecord::builder(
            ResourceKind::Instance,
            Scope::new("acct-1", "us-south"),
            "web-1",
        )
        .build();
        let task = TaskRecord::new(
            Uuid::new_v4(),
            TaskPhase::Provisioning,
            "workload",
            ResourceKind::Instance,
            "web-1",
            TaskAction::Add,
            Some(record.id),
        );
        store.insert_resource(record).unwrap();
        store.insert_tasks(std::slice::from_ref(&task)).unwrap();
        cloud.add_classic_instance("cci-1", "web-1", 1);

        Fixture {
            store,
            sweeper: Sweeper::new(ctx, driver.clone()),
            driver,
            task,
        }
    }

    fn plan() -> MigrationPlan {
        MigrationPlan {
            account: "classic-1".to_string(),
            source: ClassicSource::Instance {
                id: "cci-1".to_string(),
                windows_backup: false,
            },
        }
    }

    #[tokio::test]
    async fn test_fresh_dispatch_is_left_alone() {
        let f = fixture(0);
        let step = f.driver.begin(&f.task, &plan()).unwrap();

        let summary = f.sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(summary.examined, 1);
        assert_eq!(summary.resumed, 0);
        assert!(f.store.get_step(step.id).unwrap().in_focus);
    }

    #[tokio::test]
    async fn test_orphaned_poll_is_driven_to_completion() {
        let f = fixture(0);
        let step = f.driver.begin(&f.task, &plan()).unwrap();
        // the executor dispatched the snapshot and then went away
        f.driver.step(step.id, Phase::Dispatch, "executor-1").await.unwrap();

        let summary = f.sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(summary.resumed, 1);
        let after = f.store.get_step(step.id).unwrap();
        assert_eq!(after.stage, vpcflow_core::MigrationStage::UploadToCos);
        assert!(!after.in_focus);

        for _ in 0..5 {
            f.sweeper.sweep_once(Utc::now()).await.unwrap();
        }
        assert_eq!(f.store.get_step(step.id).unwrap().status, MigrationStatus::Success);
        assert_eq!(
            f.store.get_task(f.task.id).unwrap().status,
            vpcflow_core::TaskStatus::Success
        );
    }

    #[tokio::test]
    async fn test_expired_dispatch_lease_is_taken_over() {
        let f = fixture(0);
        let step = f.driver.begin(&f.task, &plan()).unwrap();

        // a worker claimed the dispatch half and crashed before writing back
        let claimed_at = Utc::now() - ChronoDuration::seconds(120);
        f.store
            .try_claim(step.id, Phase::Dispatch, "crashed", claimed_at, ChronoDuration::seconds(60))
            .unwrap()
            .unwrap();

        let summary = f.sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(summary.resumed, 1);
        let after = f.store.get_step(step.id).unwrap();
        assert!(after.lease.is_none());
        assert!(!after.in_focus);
    }

    #[tokio::test]
    async fn test_live_lease_is_not_swept() {
        let f = fixture(0);
        let step = f.driver.begin(&f.task, &plan()).unwrap();
        f.driver.step(step.id, Phase::Dispatch, "executor-1").await.unwrap();

        let now = Utc::now();
        f.store
            .try_claim(step.id, Phase::Poll, "executor-2", now, ChronoDuration::seconds(60))
            .unwrap()
            .unwrap();

        let summary = f.sweeper.sweep_once(now).await.unwrap();
        assert_eq!(summary.examined, 0);
        assert!(f.store.get_step(step.id).unwrap().held_by("executor-2"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(0);
        let handle = f.sweeper.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown().await;
    }
}
