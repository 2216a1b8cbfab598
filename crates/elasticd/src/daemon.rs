//! Session assembly and the background tasks the daemon runs around it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use elastic_core::{CloudResources, CoreCatalog, CoreId};
use elastic_provider::{CloudProvider, LoopbackConnector};
use elastic_runtime::{ElasticSession, LaunchEvent, ResourceOptimizer, ScheduleOptimizer};
use elastic_scheduler::{ActionId, SchedulableAction};

use crate::fleet::FleetConfig;

/// How often the provisioner looks for creations that are due.
const PROVISION_POLL: Duration = Duration::from_millis(250);

/// A session wired from a fleet file, plus the ids of its task types.
pub struct Assembly {
    pub session: Arc<ElasticSession>,
    pub launches: mpsc::UnboundedReceiver<LaunchEvent>,
    pub cores: Vec<CoreId>,
}

/// Build a session from `fleet` and request its initial instances.
pub async fn assemble(fleet: &FleetConfig) -> anyhow::Result<Assembly> {
    let (session, launches) = ElasticSession::new(fleet.elastic.clone(), CoreCatalog::new());

    let mut cores = Vec::with_capacity(fleet.cores.len());
    for core in &fleet.cores {
        let implementations = core
            .implementations
            .iter()
            .map(|i| (i.name.clone(), i.requirements.clone()))
            .collect();
        cores.push(session.register_core(&core.signature, implementations).await?);
    }

    for spec in &fleet.providers {
        let connector = if spec.decline {
            LoopbackConnector::declining(&spec.name)
        } else {
            LoopbackConnector::new(&spec.name)
        };
        let mut provider = CloudProvider::new(&spec.name, spec.limit, Arc::new(connector));
        for instance_type in &spec.instance_types {
            provider.add_instance_type(instance_type.clone());
        }
        for image in &spec.images {
            provider.add_image(image.clone());
        }
        session.register_provider(provider).await?;
        info!(provider = %spec.name, types = spec.instance_types.len(), "provider registered");
    }

    for worker in &fleet.workers {
        session.add_worker(&worker.name, worker.description.clone(), None).await?;
    }

    let session = Arc::new(session);
    request_initial_instances(&session).await?;
    Ok(Assembly {
        session,
        launches,
        cores,
    })
}

/// Ask for `initial_vms` instances of the cheapest shape on offer.
async fn request_initial_instances(session: &ElasticSession) -> anyhow::Result<()> {
    let wanted = session.config().elasticity.initial_vms;
    if wanted == 0 {
        return Ok(());
    }
    let catalog = session.catalog();
    let catalog = catalog.read().await;
    let providers = session.providers();
    let mut manager = providers.lock().await;

    let mut shapes: Vec<(f64, String, String, String)> = Vec::new();
    for provider in manager.providers() {
        for instance_type in provider.instance_types() {
            for image in provider.images() {
                let cost = provider.instance_cost_per_hour(&instance_type.name, &image.name)?;
                shapes.push((
                    cost,
                    provider.name().to_string(),
                    instance_type.name.clone(),
                    image.name.clone(),
                ));
            }
        }
    }
    shapes.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut requested = 0;
    for (cost, provider, type_name, image) in &shapes {
        while requested < wanted {
            if manager.request_creation(provider, type_name, image, &catalog)?.is_none() {
                break;
            }
            requested += 1;
            debug!(%provider, instance_type = %type_name, %image, cost, "initial instance requested");
        }
    }
    if requested < wanted {
        warn!(requested, wanted, "providers could not supply every initial instance");
    }
    info!(requested, "initial instances requested");
    Ok(())
}

/// Confirm creations once their image boot time has elapsed. Loopback
/// connectors start nothing, so the daemon plays the provider's part.
pub fn spawn_provisioner(session: Arc<ElasticSession>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(PROVISION_POLL) => {
                    for (request_id, worker, granted) in due_creations(&session).await {
                        match session.creation_confirmed(request_id, &worker, granted).await {
                            Ok(()) => info!(%worker, request = request_id, "instance ready"),
                            Err(e) => tracing::error!(error = %e, request = request_id, "confirming creation failed"),
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("provisioner shutting down");
                    break;
                }
            }
        }
    })
}

async fn due_creations(session: &ElasticSession) -> Vec<(u64, String, CloudResources)> {
    let providers = session.providers();
    let manager = providers.lock().await;
    manager
        .pending_requests()
        .into_iter()
        .filter(|request| {
            let boot = manager
                .provider(&request.provider)
                .and_then(|p| p.image(&request.image))
                .map(|image| image.creation_time_ms)
                .unwrap_or(0);
            request.elapsed_ms() >= boot
        })
        .map(|request| {
            let worker = format!("{}-vm{}", request.provider, request.id);
            (request.id, worker, request.description.clone())
        })
        .collect()
}

/// Run both optimizer loops until `shutdown` flips.
pub fn spawn_optimizers(session: &Arc<ElasticSession>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let optimization = &session.config().optimization;
    let schedule_interval = Duration::from_millis(optimization.schedule_interval_ms);
    let resource_interval = Duration::from_millis(optimization.resource_interval_ms);

    let schedule = ScheduleOptimizer::new(Arc::clone(session));
    let schedule_shutdown = shutdown.clone();
    let resources = ResourceOptimizer::new(Arc::clone(session));
    let resource_shutdown = shutdown.clone();
    vec![
        tokio::spawn(async move { schedule.run(schedule_interval, schedule_shutdown).await }),
        tokio::spawn(async move { resources.run(resource_interval, resource_shutdown).await }),
    ]
}

/// Stand-in for a task engine: runs every launched action for `task_ms`
/// and reports it back. Returns once `total` actions completed or
/// `shutdown` flips.
pub async fn execute(
    session: Arc<ElasticSession>,
    mut launches: mpsc::UnboundedReceiver<LaunchEvent>,
    task_ms: u64,
    total: usize,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<ActionId>();
    let mut completed = 0;
    while completed < total {
        tokio::select! {
            Some(event) = launches.recv() => {
                if let Err(e) = session.notify_launched(event.action).await {
                    warn!(action = event.action, error = %e, "launch notification failed");
                    continue;
                }
                debug!(action = event.action, worker = %event.worker, "action running");
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(task_ms)).await;
                    let _ = done_tx.send(event.action);
                });
            }
            Some(id) = done_rx.recv() => {
                match session.notify_completion(id).await {
                    Ok(freed) => debug!(action = id, freed = freed.len(), "action finished"),
                    Err(e) => warn!(action = id, error = %e, "completion notification failed"),
                }
                completed += 1;
            }
            _ = shutdown.changed() => break,
            else => break,
        }
    }
    completed
}

/// Submit `count` independent actions spread over `cores`. Returns how
/// many were accepted.
pub async fn submit_workload(session: &ElasticSession, cores: &[CoreId], count: usize) -> usize {
    let mut accepted = 0;
    for (index, core_id) in cores.iter().cycle().take(count).enumerate() {
        let id = index as ActionId + 1;
        match session.submit(SchedulableAction::new(id, *core_id)).await {
            Ok(result) => {
                debug!(action = id, core_id, ?result, "action submitted");
                accepted += 1;
            }
            Err(e) => warn!(action = id, core_id, error = %e, "action rejected"),
        }
    }
    accepted
}

/// Wait until no creation is pending, or `shutdown` flips.
pub async fn wait_for_instances(session: &ElasticSession, shutdown: &mut watch::Receiver<bool>) {
    loop {
        if session.providers().lock().await.pending_vm_count() == 0 {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(PROVISION_POLL) => {}
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLEET: &str = r#"
[elasticity]
initial_vms = 1
max_vms = 2

[[cores]]
signature = "work"

[[cores.implementations]]
name = "work.cpu"
requirements = { kind = "method", capacity = { cpu = 1 } }

[[workers]]
name = "local"
description = { kind = "method", capacity = { cpu = 2 } }

[[providers]]
name = "dear"

[[providers.instance_types]]
name = "small"
price_per_hour = 0.9
resources = { capacity = { cpu = 2 } }

[[providers.images]]
name = "base"

[[providers]]
name = "cheap"

[[providers.instance_types]]
name = "small"
price_per_hour = 0.2
resources = { capacity = { cpu = 2 } }

[[providers.images]]
name = "base"
"#;

    #[tokio::test]
    async fn assembly_registers_everything_and_asks_the_cheapest_provider() {
        let fleet = FleetConfig::from_toml_str(FLEET).unwrap();
        let assembly = assemble(&fleet).await.unwrap();

        assert_eq!(assembly.cores.len(), 1);
        assert!(assembly.session.worker("local").await.is_some());
        let providers = assembly.session.providers();
        let manager = providers.lock().await;
        let pending = manager.pending_requests();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].provider, "cheap");
    }

    #[tokio::test]
    async fn provisioner_turns_due_requests_into_workers() {
        let fleet = FleetConfig::from_toml_str(FLEET).unwrap();
        let assembly = assemble(&fleet).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut waiter = shutdown_rx.clone();

        let provisioner = spawn_provisioner(Arc::clone(&assembly.session), shutdown_rx);
        wait_for_instances(&assembly.session, &mut waiter).await;
        let _ = shutdown_tx.send(true);
        provisioner.await.unwrap();

        let names: Vec<String> = assembly
            .session
            .worker_handles()
            .await
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert!(names.iter().any(|n| n.starts_with("cheap-vm")), "{names:?}");
    }

    #[tokio::test]
    async fn workload_runs_to_completion() {
        let fleet = FleetConfig::from_toml_str(FLEET).unwrap();
        let assembly = assemble(&fleet).await.unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let accepted = submit_workload(&assembly.session, &assembly.cores, 5).await;
        let completed = execute(Arc::clone(&assembly.session), assembly.launches, 5, accepted, shutdown_rx).await;

        assert_eq!(accepted, 5);
        assert_eq!(completed, 5);
        assert!(assembly.session.blocked_actions().await.unwrap().is_empty());
    }
}
