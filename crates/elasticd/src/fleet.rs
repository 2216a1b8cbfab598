//! fleet.toml parser: the elastic settings plus the task types, static
//! workers and providers the daemon starts with.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use elastic_core::{ElasticConfig, ResourceDescription};
use elastic_provider::{Image, InstanceType};

/// Contents of a fleet file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(flatten)]
    pub elastic: ElasticConfig,
    #[serde(default)]
    pub cores: Vec<CoreSpec>,
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
}

/// A task type and its implementations, in preference order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSpec {
    pub signature: String,
    pub implementations: Vec<ImplementationSpec>,
}

/// One implementation of a task type and what it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementationSpec {
    pub name: String,
    pub requirements: ResourceDescription,
}

/// A worker present from startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    pub description: ResourceDescription,
}

/// An elastic provider and its offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub limit: Option<u32>,
    /// Refuse every creation; useful to watch the optimizer back off.
    #[serde(default)]
    pub decline: bool,
    #[serde(default)]
    pub instance_types: Vec<InstanceType>,
    #[serde(default)]
    pub images: Vec<Image>,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let fleet: FleetConfig = toml::from_str(content)?;
        fleet.validate()?;
        Ok(fleet)
    }

    /// Reject fleets the daemon could not start.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.elastic.validate()?;

        let mut signatures = BTreeSet::new();
        for core in &self.cores {
            if core.implementations.is_empty() {
                bail!("task type {} has no implementation", core.signature);
            }
            if !signatures.insert(core.signature.as_str()) {
                bail!("task type {} declared twice", core.signature);
            }
        }

        let mut names = BTreeSet::new();
        for worker in &self.workers {
            if worker.description.is_elastic() {
                bail!("worker {} is a cloud worker; declare a provider instead", worker.name);
            }
            if !names.insert(worker.name.as_str()) {
                bail!("worker {} declared twice", worker.name);
            }
        }

        let mut providers = BTreeSet::new();
        for provider in &self.providers {
            if !providers.insert(provider.name.as_str()) {
                bail!("provider {} declared twice", provider.name);
            }
            if provider.instance_types.is_empty() || provider.images.is_empty() {
                bail!("provider {} needs at least one instance type and one image", provider.name);
            }
        }
        if self.elastic.elasticity.initial_vms > 0 && self.providers.is_empty() {
            bail!("initial_vms is set but no provider is declared");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elastic_core::OptimizationGoal;

    const SAMPLE: &str = r#"
[elasticity]
min_vms = 0
initial_vms = 1
max_vms = 3

[optimization]
goal = "cost"
cost_budget = 12.5

[[cores]]
signature = "render"

[[cores.implementations]]
name = "render.cpu"
requirements = { kind = "method", capacity = { cpu = 2 } }

[[workers]]
name = "local"
description = { kind = "method", capacity = { cpu = 4 } }

[[providers]]
name = "loopback"
limit = 4

[[providers.instance_types]]
name = "small"
price_per_hour = 0.2
idle_power = 8.0
resources = { capacity = { cpu = 2 } }

[[providers.images]]
name = "base"
creation_time_ms = 1500
"#;

    #[test]
    fn test_parse_sample_fleet() {
        let fleet = FleetConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(fleet.elastic.elasticity.max_vms, 3);
        assert_eq!(fleet.elastic.optimization.goal, OptimizationGoal::Cost);
        assert_eq!(fleet.elastic.optimization.cost_budget, 12.5);
        assert!(fleet.elastic.optimization.time_budget_s.is_infinite());
        assert_eq!(fleet.cores[0].implementations[0].requirements, ResourceDescription::cpus(2));
        assert_eq!(fleet.workers[0].description, ResourceDescription::cpus(4));
        let provider = &fleet.providers[0];
        assert_eq!(provider.limit, Some(4));
        assert!(!provider.decline);
        assert_eq!(provider.instance_types[0].idle_power, 8.0);
        assert_eq!(provider.images[0].creation_time_ms, 1500);
    }

    #[test]
    fn test_empty_file_is_an_empty_fleet() {
        let fleet = FleetConfig::from_toml_str("").unwrap();
        assert!(fleet.cores.is_empty());
        assert!(fleet.providers.is_empty());
        assert_eq!(fleet.elastic, ElasticConfig::default());
    }

    #[test]
    fn test_rejects_initial_vms_without_provider() {
        let content = "[elasticity]\ninitial_vms = 1\nmax_vms = 1\n";
        let err = FleetConfig::from_toml_str(content).unwrap_err();
        assert!(err.to_string().contains("no provider"));
    }

    #[test]
    fn test_rejects_duplicate_workers() {
        let content = r#"
[[workers]]
name = "a"
description = { kind = "method", capacity = { cpu = 1 } }

[[workers]]
name = "a"
description = { kind = "method", capacity = { cpu = 2 } }
"#;
        let err = FleetConfig::from_toml_str(content).unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn test_invalid_elastic_settings_are_fatal() {
        let content = "[elasticity]\nmin_vms = 3\nmax_vms = 1\n";
        assert!(FleetConfig::from_toml_str(content).is_err());
    }

    #[test]
    fn test_from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(FleetConfig::from_file(&path).unwrap().cores.len(), 1);

        let missing = dir.path().join("missing.toml");
        let err = FleetConfig::from_file(&missing).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }
}
