//! Global load balancing across workers.
//!
//! Each pass re-optimizes every worker locally, then lets the most
//! committed workers (the donors) hand one pending action to the first
//! less committed worker that would finish it strictly earlier. Passes
//! repeat until one moves nothing.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use elastic_core::{ImplId, Implementation, MoScore, Timestamp};
use elastic_scheduler::{ActionId, DonationCandidate, SchedulerError, WorkerHandle};

use crate::error::{RuntimeError, RuntimeResult};
use crate::session::ElasticSession;

/// Upper bound on passes per call, in case two workers keep trading.
const MAX_PASSES: usize = 1_000;

/// One action moved from a donor to a receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub action: ActionId,
    pub from: String,
    pub to: String,
    pub impl_id: ImplId,
    /// Expected completion on the donor before the move.
    pub from_completion: Timestamp,
    /// Expected completion on the receiver, transfer penalty included.
    pub to_completion: Timestamp,
}

struct WorkerView {
    handle: WorkerHandle,
    indicator: Timestamp,
    donations: Vec<DonationCandidate>,
}

/// Periodic load balancer moving pending actions between workers.
pub struct ScheduleOptimizer {
    session: Arc<ElasticSession>,
}

impl ScheduleOptimizer {
    /// A balancer working on `session`.
    pub fn new(session: Arc<ElasticSession>) -> Self {
        Self { session }
    }

    /// Balance the pending work. Returns the migrations performed, in
    /// order.
    pub async fn global_optimization(&self) -> RuntimeResult<Vec<Migration>> {
        let mut migrations = Vec::new();
        for pass in 0..MAX_PASSES {
            let views = self.local_optimizations().await?;
            let Some(migration) = self.balance(&views).await? else {
                debug!(pass, "load balanced");
                break;
            };
            info!(
                action = migration.action,
                from = %migration.from,
                to = %migration.to,
                pass,
                "action moved to a less loaded worker"
            );
            migrations.push(migration);
        }
        Ok(migrations)
    }

    async fn local_optimizations(&self) -> RuntimeResult<Vec<WorkerView>> {
        let update_id = self.session.now_ms();
        let mut views = Vec::new();
        for handle in self.session.worker_handles().await {
            let report = match self.session.optimize_worker(&handle, update_id).await {
                Ok(report) => report,
                Err(RuntimeError::Scheduler(SchedulerError::WorkerGone(worker))) => {
                    debug!(%worker, "worker left during optimization");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let snapshot = handle.snapshot().await?;
            views.push(WorkerView {
                handle,
                indicator: snapshot.donation_indicator,
                donations: report.donation_queue,
            });
        }
        Ok(views)
    }

    /// Perform at most one migration from the most loaded workers.
    async fn balance(&self, views: &[WorkerView]) -> RuntimeResult<Option<Migration>> {
        let Some(max) = views.iter().map(|v| v.indicator).max() else {
            return Ok(None);
        };
        let donors: Vec<&WorkerView> = views.iter().filter(|v| v.indicator == max).collect();
        let mut receivers: Vec<&WorkerView> = views.iter().filter(|v| v.indicator < max).collect();
        receivers.sort_by(|a, b| {
            a.indicator
                .cmp(&b.indicator)
                .then_with(|| a.handle.name().cmp(b.handle.name()))
        });
        if receivers.is_empty() {
            return Ok(None);
        }

        for donor in donors {
            for candidate in &donor.donations {
                for receiver in &receivers {
                    if let Some(migration) = self.try_move(candidate, &donor.handle, &receiver.handle).await? {
                        return Ok(Some(migration));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Move `candidate` to `receiver` if some implementation there beats
    /// its current placement, transfer penalty included.
    async fn try_move(
        &self,
        candidate: &DonationCandidate,
        donor: &WorkerHandle,
        receiver: &WorkerHandle,
    ) -> RuntimeResult<Option<Migration>> {
        let action = &candidate.action;
        let Some(current) = donor.current_score(action.id).await? else {
            return Ok(None);
        };
        let implementations: Vec<Implementation> = {
            let catalog = self.session.catalog();
            let catalog = catalog.read().await;
            catalog.implementations(action.core_id).to_vec()
        };
        let optimization = &self.session.config().optimization;
        let data_available = self.session.board().data_ready_time(&action.data_predecessors);

        let mut best: Option<(MoScore, Implementation)> = None;
        for implementation in implementations {
            let score = receiver
                .score(
                    action.clone(),
                    implementation.clone(),
                    data_available,
                    optimization.transfer_penalty_ms,
                )
                .await?;
            let Some(score) = score else {
                continue;
            };
            if MoScore::is_better_opt(Some(&score), best.as_ref().map(|(s, _)| s), optimization.goal) {
                best = Some((score, implementation));
            }
        }

        let Some((score, implementation)) = best else {
            return Ok(None);
        };
        if !score.is_better(&current, optimization.goal) {
            return Ok(None);
        }
        let impl_id = implementation.impl_id;
        if !self.session.migrate(action.id, donor, receiver, implementation).await? {
            return Ok(None);
        }
        Ok(Some(Migration {
            action: action.id,
            from: donor.name().to_string(),
            to: receiver.name().to_string(),
            impl_id,
            from_completion: current.completion_time(),
            to_completion: score.completion_time(),
        }))
    }

    /// Run `global_optimization` every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs_f64(), "schedule optimizer started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.global_optimization().await {
                        Ok(migrations) if !migrations.is_empty() => {
                            debug!(migrations = migrations.len(), "schedule optimization applied");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "schedule optimization failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("schedule optimizer shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elastic_core::{CoreCatalog, ElasticConfig, ResourceDescription};
    use elastic_scheduler::SchedulableAction;

    async fn session_with(penalty: Timestamp) -> Arc<ElasticSession> {
        let mut config = ElasticConfig::default();
        config.optimization.transfer_penalty_ms = penalty;
        let (session, _rx) = ElasticSession::new(config, CoreCatalog::new());
        session
            .register_core("work", vec![("work".into(), ResourceDescription::cpus(1))])
            .await
            .unwrap();
        Arc::new(session)
    }

    #[tokio::test]
    async fn single_worker_has_nobody_to_give_to() {
        let session = session_with(0).await;
        session.add_worker("w1", ResourceDescription::cpus(1), None).await.unwrap();
        for id in 1..=3 {
            session.submit(SchedulableAction::new(id, 0)).await.unwrap();
        }

        let migrations = ScheduleOptimizer::new(Arc::clone(&session)).global_optimization().await.unwrap();

        assert!(migrations.is_empty());
    }

    #[tokio::test]
    async fn queued_work_moves_to_idle_worker() {
        let session = session_with(0).await;
        session.add_worker("w1", ResourceDescription::cpus(1), None).await.unwrap();
        for id in 1..=4 {
            session.submit(SchedulableAction::new(id, 0)).await.unwrap();
        }
        session.add_worker("w2", ResourceDescription::cpus(1), None).await.unwrap();

        let migrations = ScheduleOptimizer::new(Arc::clone(&session)).global_optimization().await.unwrap();

        assert!(!migrations.is_empty());
        assert!(migrations.iter().all(|m| m.from == "w1" && m.to == "w2"));
        // Among equal priorities the latest-ending action goes first.
        assert_eq!(migrations[0].action, 4);
        assert_eq!(session.worker_of(4).await.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn large_penalty_prevents_moves() {
        let session = session_with(1_000_000).await;
        session.add_worker("w1", ResourceDescription::cpus(1), None).await.unwrap();
        for id in 1..=4 {
            session.submit(SchedulableAction::new(id, 0)).await.unwrap();
        }
        session.add_worker("w2", ResourceDescription::cpus(1), None).await.unwrap();

        let migrations = ScheduleOptimizer::new(Arc::clone(&session)).global_optimization().await.unwrap();

        assert!(migrations.is_empty());
        assert_eq!(session.worker_of(4).await.as_deref(), Some("w1"));
    }
}
