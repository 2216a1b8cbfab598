//! Worker actor: one task owns a `ResourceScheduler` and serves requests
//! from a command queue.
//!
//! Local optimization runs the simulation on a blocking task. While it
//! runs the actor keeps draining commands: placements are deferred and
//! removals recorded until the outcome is installed.

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error};

use elastic_core::{Capacity, Implementation, MoScore, ResourceDescription, Timestamp};

use crate::action::{ActionId, PlacementResult, SchedulableAction};
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::{DonationCandidate, OptimizationReport, ResourceScheduler, WorkerSnapshot};
use crate::simulation::{simulate_local, OptimizationOutcome};

const COMMAND_BUFFER: usize = 256;

type Reply<T> = oneshot::Sender<T>;

/// Elastic change of a worker's capacity.
#[derive(Debug, Clone)]
pub enum CapacityChange {
    Increase {
        extra: Capacity,
        description: ResourceDescription,
    },
    Reduce {
        removed: Capacity,
        description: ResourceDescription,
    },
}

/// Requests served by a worker actor.
pub enum WorkerCommand {
    Schedule {
        action: SchedulableAction,
        implementation: Implementation,
        reply: Reply<PlacementResult>,
    },
    Unschedule {
        id: ActionId,
        reply: Reply<SchedulerResult<Vec<ActionId>>>,
    },
    Launched {
        id: ActionId,
        started_at: Timestamp,
        reply: Reply<SchedulerResult<()>>,
    },
    Completed {
        id: ActionId,
        finished_at: Timestamp,
        reply: Reply<SchedulerResult<Vec<ActionId>>>,
    },
    Optimize {
        update_id: Timestamp,
        reply: Reply<SchedulerResult<OptimizationReport>>,
    },
    Snapshot {
        reply: Reply<WorkerSnapshot>,
    },
    Score {
        action: SchedulableAction,
        implementation: Implementation,
        data_available: Timestamp,
        penalty: Timestamp,
        reply: Reply<Option<MoScore>>,
    },
    CurrentScore {
        id: ActionId,
        reply: Reply<Option<MoScore>>,
    },
    BlockedActions {
        reply: Reply<Vec<SchedulableAction>>,
    },
    Executable {
        ids: Vec<ActionId>,
        reply: Reply<Vec<ActionId>>,
    },
    DonationQueue {
        reply: Reply<Vec<DonationCandidate>>,
    },
    Resize {
        change: CapacityChange,
        reply: Reply<bool>,
    },
    Shutdown {
        reply: Reply<WorkerSnapshot>,
    },
}

/// Cloneable address of a worker actor.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    name: String,
    tx: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
    /// Start the actor on the current tokio runtime.
    pub fn spawn(scheduler: ResourceScheduler) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let name = scheduler.worker().to_string();
        let task = tokio::spawn(run_worker(scheduler, rx));
        (Self { name, tx }, task)
    }

    /// Name of the worker behind this handle.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> WorkerCommand) -> SchedulerResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| SchedulerError::WorkerGone(self.name.clone()))?;
        rx.await.map_err(|_| SchedulerError::WorkerGone(self.name.clone()))
    }

    /// Place `action` with `implementation`.
    pub async fn schedule(
        &self,
        action: SchedulableAction,
        implementation: Implementation,
    ) -> SchedulerResult<PlacementResult> {
        self.request(|reply| WorkerCommand::Schedule {
            action,
            implementation,
            reply,
        })
        .await
    }

    /// Take `id` off the worker. Returns the actions it unblocked.
    pub async fn unschedule(&self, id: ActionId) -> SchedulerResult<Vec<ActionId>> {
        self.request(|reply| WorkerCommand::Unschedule { id, reply }).await?
    }

    pub async fn launched(&self, id: ActionId, started_at: Timestamp) -> SchedulerResult<()> {
        self.request(|reply| WorkerCommand::Launched { id, started_at, reply })
            .await?
    }

    /// `id` finished at `finished_at`. Returns the actions that can now start.
    pub async fn completed(&self, id: ActionId, finished_at: Timestamp) -> SchedulerResult<Vec<ActionId>> {
        self.request(|reply| WorkerCommand::Completed {
            id,
            finished_at,
            reply,
        })
        .await?
    }

    /// Run a local optimization on a blocking thread and install it.
    pub async fn optimize(&self, update_id: Timestamp) -> SchedulerResult<OptimizationReport> {
        self.request(|reply| WorkerCommand::Optimize { update_id, reply })
            .await?
    }

    /// Current state of the worker.
    pub async fn snapshot(&self) -> SchedulerResult<WorkerSnapshot> {
        self.request(|reply| WorkerCommand::Snapshot { reply }).await
    }

    /// Score of running `action` here with `implementation`.
    pub async fn score(
        &self,
        action: SchedulableAction,
        implementation: Implementation,
        data_available: Timestamp,
        penalty: Timestamp,
    ) -> SchedulerResult<Option<MoScore>> {
        self.request(|reply| WorkerCommand::Score {
            action,
            implementation,
            data_available,
            penalty,
            reply,
        })
        .await
    }

    pub async fn current_score(&self, id: ActionId) -> SchedulerResult<Option<MoScore>> {
        self.request(|reply| WorkerCommand::CurrentScore { id, reply }).await
    }

    /// Actions parked on this worker.
    pub async fn blocked_actions(&self) -> SchedulerResult<Vec<SchedulableAction>> {
        self.request(|reply| WorkerCommand::BlockedActions { reply }).await
    }

    pub async fn executable(&self, ids: Vec<ActionId>) -> SchedulerResult<Vec<ActionId>> {
        self.request(|reply| WorkerCommand::Executable { ids, reply }).await
    }

    pub async fn donation_queue(&self) -> SchedulerResult<Vec<DonationCandidate>> {
        self.request(|reply| WorkerCommand::DonationQueue { reply }).await
    }

    /// Grow or shrink the worker. Returns false when the capacity to
    /// remove is in use.
    pub async fn resize(&self, change: CapacityChange) -> SchedulerResult<bool> {
        self.request(|reply| WorkerCommand::Resize { change, reply }).await
    }

    /// Stop the actor and return its final state.
    pub async fn shutdown(&self) -> SchedulerResult<WorkerSnapshot> {
        self.request(|reply| WorkerCommand::Shutdown { reply }).await
    }
}

enum Next {
    Command(Option<WorkerCommand>),
    Outcome(Result<OptimizationOutcome, JoinError>),
}

type InFlight = (JoinHandle<OptimizationOutcome>, Reply<SchedulerResult<OptimizationReport>>);

async fn run_worker(mut scheduler: ResourceScheduler, mut rx: mpsc::Receiver<WorkerCommand>) {
    let mut in_flight: Option<InFlight> = None;

    loop {
        let next = match in_flight.as_mut() {
            Some((task, _)) => tokio::select! {
                outcome = task => Next::Outcome(outcome),
                command = rx.recv() => Next::Command(command),
            },
            None => Next::Command(rx.recv().await),
        };

        match next {
            Next::Outcome(result) => {
                let Some((_, reply)) = in_flight.take() else {
                    continue;
                };
                let report = match result {
                    Ok(outcome) => scheduler.finish_optimization(outcome),
                    Err(err) => {
                        error!(worker = %scheduler.worker(), error = %err, "local simulation failed");
                        Ok(scheduler.abort_optimization())
                    }
                };
                let _ = reply.send(report);
            }
            Next::Command(None) => break,
            Next::Command(Some(WorkerCommand::Optimize { update_id, reply })) => {
                if in_flight.is_some() {
                    let _ = reply.send(Err(SchedulerError::OptimizationInProgress(
                        scheduler.worker().to_string(),
                    )));
                    continue;
                }
                match scheduler.begin_optimization(update_id) {
                    Ok(input) => {
                        let task = tokio::task::spawn_blocking(move || simulate_local(&input));
                        in_flight = Some((task, reply));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Next::Command(Some(WorkerCommand::Shutdown { reply })) => {
                if let Some((task, pending)) = in_flight.take() {
                    task.abort();
                    let _ = pending.send(Ok(scheduler.abort_optimization()));
                }
                let _ = reply.send(scheduler.snapshot());
                break;
            }
            Next::Command(Some(command)) => handle(&mut scheduler, command),
        }
    }
    debug!(worker = %scheduler.worker(), "worker actor stopped");
}

fn handle(scheduler: &mut ResourceScheduler, command: WorkerCommand) {
    match command {
        WorkerCommand::Schedule {
            action,
            implementation,
            reply,
        } => {
            let _ = reply.send(scheduler.schedule_action(action, &implementation));
        }
        WorkerCommand::Unschedule { id, reply } => {
            let _ = reply.send(scheduler.unschedule_action(id));
        }
        WorkerCommand::Launched { id, started_at, reply } => {
            let _ = reply.send(scheduler.action_launched(id, started_at));
        }
        WorkerCommand::Completed { id, finished_at, reply } => {
            let _ = reply.send(scheduler.action_completed(id, finished_at));
        }
        WorkerCommand::Snapshot { reply } => {
            let _ = reply.send(scheduler.snapshot());
        }
        WorkerCommand::Score {
            action,
            implementation,
            data_available,
            penalty,
            reply,
        } => {
            let _ = reply.send(scheduler.implementation_score(&action, &implementation, data_available, penalty));
        }
        WorkerCommand::CurrentScore { id, reply } => {
            let _ = reply.send(scheduler.current_score(id));
        }
        WorkerCommand::BlockedActions { reply } => {
            let _ = reply.send(scheduler.blocked_actions());
        }
        WorkerCommand::Executable { ids, reply } => {
            let _ = reply.send(scheduler.executable(&ids));
        }
        WorkerCommand::DonationQueue { reply } => {
            let _ = reply.send(scheduler.donation_queue());
        }
        WorkerCommand::Resize { change, reply } => {
            let applied = match change {
                CapacityChange::Increase { extra, description } => {
                    scheduler.increase_capacity(&extra, description);
                    true
                }
                CapacityChange::Reduce { removed, description } => scheduler.reduce_capacity(&removed, description),
            };
            let _ = reply.send(applied);
        }
        // routed by the actor loop
        WorkerCommand::Optimize { .. } | WorkerCommand::Shutdown { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::ActionBoard;

    fn cpu_impl(cpu: u32) -> Implementation {
        Implementation {
            core_id: 0,
            impl_id: 0,
            signature: "core0.impl0".into(),
            requirements: ResourceDescription::cpus(cpu),
        }
    }

    fn make_worker(cpu: u32) -> (WorkerHandle, JoinHandle<()>) {
        let scheduler = ResourceScheduler::new("w1", ResourceDescription::cpus(cpu), ActionBoard::new(), 1.0, 0.0);
        WorkerHandle::spawn(scheduler)
    }

    #[tokio::test]
    async fn test_schedule_through_actor() {
        let (worker, _task) = make_worker(4);
        for id in 1..=3 {
            worker.schedule(SchedulableAction::new(id, 0), cpu_impl(2)).await.unwrap();
        }

        let blocked: Vec<_> = worker.blocked_actions().await.unwrap().iter().map(|a| a.id).collect();
        assert_eq!(blocked, vec![3]);
        assert_eq!(worker.executable(vec![1, 2, 3]).await.unwrap(), vec![1, 2]);

        let snapshot = worker.snapshot().await.unwrap();
        assert_eq!(snapshot.scheduled_actions, 3);
        assert_eq!(snapshot.donation_indicator, 200);
    }

    #[tokio::test]
    async fn test_optimize_through_actor() {
        let (worker, _task) = make_worker(1);
        worker.schedule(SchedulableAction::new(1, 0), cpu_impl(1)).await.unwrap();
        worker
            .schedule(SchedulableAction::new(2, 0).with_priority(5), cpu_impl(1))
            .await
            .unwrap();

        let report = worker.optimize(0).await.unwrap();

        assert_eq!(report.launchable, vec![2]);
        let queue: Vec<_> = report.donation_queue.iter().map(|c| c.action.id).collect();
        assert_eq!(queue, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_completion_frees_waiters() {
        let (worker, _task) = make_worker(1);
        worker.schedule(SchedulableAction::new(1, 0), cpu_impl(1)).await.unwrap();
        worker.schedule(SchedulableAction::new(2, 0), cpu_impl(1)).await.unwrap();
        worker.launched(1, 0).await.unwrap();

        assert_eq!(worker.completed(1, 80).await.unwrap(), vec![2]);
        assert!(matches!(
            worker.completed(1, 90).await,
            Err(SchedulerError::ActionNotFound(1))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_actor() {
        let (worker, task) = make_worker(2);
        worker.schedule(SchedulableAction::new(1, 0), cpu_impl(1)).await.unwrap();

        let last = worker.shutdown().await.unwrap();
        assert_eq!(last.scheduled_actions, 1);
        task.await.unwrap();

        assert!(matches!(worker.snapshot().await, Err(SchedulerError::WorkerGone(_))));
    }
}
