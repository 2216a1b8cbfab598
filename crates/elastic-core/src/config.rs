//! elastic.toml configuration parser.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Elasticity limits and optimization settings of one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElasticConfig {
    #[serde(default)]
    pub elasticity: ElasticityConfig,
    #[serde(default)]
    pub optimization: OptimizationConfig,
    #[serde(default)]
    pub defaults: IdleDefaults,
}

/// VM floor, initial count and ceiling for elastic providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElasticityConfig {
    #[serde(default)]
    pub min_vms: u32,
    #[serde(default)]
    pub initial_vms: u32,
    #[serde(default)]
    pub max_vms: u32,
}

/// What the resource optimizer minimizes first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationGoal {
    #[default]
    Time,
    Cost,
    Energy,
}

impl std::fmt::Display for OptimizationGoal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizationGoal::Time => write!(f, "time"),
            OptimizationGoal::Cost => write!(f, "cost"),
            OptimizationGoal::Energy => write!(f, "energy"),
        }
    }
}

/// Optimization goal, ceilings and loop intervals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConfig {
    #[serde(default)]
    pub goal: OptimizationGoal,
    #[serde(default = "unbounded")]
    pub time_budget_s: f64,
    #[serde(default = "unbounded")]
    pub energy_budget_wh: f64,
    #[serde(default = "unbounded")]
    pub cost_budget: f64,
    #[serde(default = "unbounded")]
    pub power_budget_w: f64,
    #[serde(default = "unbounded")]
    pub price_budget_per_h: f64,
    #[serde(default = "default_schedule_interval")]
    pub schedule_interval_ms: u64,
    #[serde(default = "default_resource_interval")]
    pub resource_interval_ms: u64,
    /// Delay charged to a migrated action for moving its input data.
    #[serde(default = "default_transfer_penalty")]
    pub transfer_penalty_ms: i64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            goal: OptimizationGoal::Time,
            time_budget_s: f64::INFINITY,
            energy_budget_wh: f64::INFINITY,
            cost_budget: f64::INFINITY,
            power_budget_w: f64::INFINITY,
            price_budget_per_h: f64::INFINITY,
            schedule_interval_ms: default_schedule_interval(),
            resource_interval_ms: default_resource_interval(),
            transfer_penalty_ms: default_transfer_penalty(),
        }
    }
}

/// Idle rates applied to workers whose profile omits them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IdleDefaults {
    #[serde(default = "default_idle_power")]
    pub idle_power_w: f64,
    #[serde(default)]
    pub idle_price_per_h: f64,
}

impl Default for IdleDefaults {
    fn default() -> Self {
        Self {
            idle_power_w: default_idle_power(),
            idle_price_per_h: 0.0,
        }
    }
}

fn unbounded() -> f64 {
    f64::INFINITY
}

fn default_schedule_interval() -> u64 {
    1_000
}

fn default_resource_interval() -> u64 {
    30_000
}

fn default_transfer_penalty() -> i64 {
    2_500
}

fn default_idle_power() -> f64 {
    1.0
}

impl ElasticConfig {
    /// Load and validate settings from a TOML file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!(
            path = %path.display(),
            goal = %config.optimization.goal,
            max_vms = config.elasticity.max_vms,
            "loaded elastic configuration"
        );
        Ok(config)
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: ElasticConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject inconsistent settings. Only called at startup.
    pub fn validate(&self) -> CoreResult<()> {
        let e = &self.elasticity;
        if e.min_vms > e.max_vms {
            return Err(CoreError::InvalidConfig(format!(
                "min_vms ({}) exceeds max_vms ({})",
                e.min_vms, e.max_vms
            )));
        }
        if e.initial_vms < e.min_vms || e.initial_vms > e.max_vms {
            return Err(CoreError::InvalidConfig(format!(
                "initial_vms ({}) outside [{}, {}]",
                e.initial_vms, e.min_vms, e.max_vms
            )));
        }

        let o = &self.optimization;
        let budgets = [
            ("time_budget_s", o.time_budget_s),
            ("energy_budget_wh", o.energy_budget_wh),
            ("cost_budget", o.cost_budget),
            ("power_budget_w", o.power_budget_w),
            ("price_budget_per_h", o.price_budget_per_h),
        ];
        for (name, value) in budgets {
            if value.is_nan() || value < 0.0 {
                return Err(CoreError::InvalidConfig(format!("{name} must be a non-negative number")));
            }
        }
        if o.schedule_interval_ms == 0 || o.resource_interval_ms == 0 {
            return Err(CoreError::InvalidConfig("optimizer intervals must be positive".into()));
        }
        if o.transfer_penalty_ms < 0 {
            return Err(CoreError::InvalidConfig("transfer_penalty_ms must not be negative".into()));
        }

        let d = &self.defaults;
        if d.idle_power_w.is_nan() || d.idle_power_w < 0.0 || d.idle_price_per_h.is_nan() || d.idle_price_per_h < 0.0 {
            return Err(CoreError::InvalidConfig("idle defaults must be non-negative".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = ElasticConfig::from_toml_str("").unwrap();
        assert_eq!(config.optimization.goal, OptimizationGoal::Time);
        assert!(config.optimization.cost_budget.is_infinite());
        assert_eq!(config.optimization.schedule_interval_ms, 1_000);
        assert_eq!(config.optimization.transfer_penalty_ms, 2_500);
        assert_eq!(config.defaults.idle_power_w, 1.0);
    }

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
[elasticity]
min_vms = 1
initial_vms = 2
max_vms = 4

[optimization]
goal = "energy"
time_budget_s = 3600.0
cost_budget = 5.0
power_budget_w = 800.0

[defaults]
idle_power_w = 20.0
idle_price_per_h = 0.36
"#;
        let config = ElasticConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.elasticity.max_vms, 4);
        assert_eq!(config.optimization.goal, OptimizationGoal::Energy);
        assert_eq!(config.optimization.power_budget_w, 800.0);
        assert!(config.optimization.energy_budget_wh.is_infinite());
        assert_eq!(config.defaults.idle_price_per_h, 0.36);
    }

    #[test]
    fn test_min_above_max_is_rejected() {
        let err = ElasticConfig::from_toml_str("[elasticity]\nmin_vms = 3\nmax_vms = 1\n").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn test_initial_outside_bounds_is_rejected() {
        let err =
            ElasticConfig::from_toml_str("[elasticity]\nmin_vms = 1\ninitial_vms = 0\nmax_vms = 2\n").unwrap_err();
        assert!(err.to_string().contains("initial_vms"));
    }

    #[test]
    fn test_negative_budget_is_rejected() {
        let err = ElasticConfig::from_toml_str("[optimization]\ncost_budget = -1.0\n").unwrap_err();
        assert!(err.to_string().contains("cost_budget"));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        assert!(ElasticConfig::from_toml_str("[optimization]\nschedule_interval_ms = 0\n").is_err());
    }

    #[test]
    fn test_bad_goal_is_a_parse_error() {
        let err = ElasticConfig::from_toml_str("[optimization]\ngoal = \"speed\"\n").unwrap_err();
        assert!(matches!(err, CoreError::Parse(_)));
    }

    #[test]
    fn test_render_round_trip() {
        let mut config = ElasticConfig::default();
        config.elasticity.max_vms = 3;
        config.optimization.cost_budget = 2.5;
        let rendered = config.to_toml_string().unwrap();
        let back = ElasticConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(back.elasticity.max_vms, 3);
        assert_eq!(back.optimization.cost_budget, 2.5);
    }
}
