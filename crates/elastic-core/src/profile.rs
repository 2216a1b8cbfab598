//! Execution statistics per (task type, implementation, worker).
//!
//! Profiles are exchanged with monitoring sinks as flat key/value
//! records. Updating a record returns the difference between the old and
//! new values so sinks can ship incremental snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::Timestamp;

const DEFAULT_EXECUTIONS: u64 = 0;
const DEFAULT_MIN_TIME: Timestamp = Timestamp::MAX;
const DEFAULT_AVG_TIME: Timestamp = 100;
const DEFAULT_MAX_TIME: Timestamp = Timestamp::MIN;
const DEFAULT_POWER: f64 = 0.0;
const DEFAULT_PRICE: f64 = 0.0;

/// Execution statistics of one implementation on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub executions: u64,
    pub min_time: Timestamp,
    pub avg_time: Timestamp,
    pub max_time: Timestamp,
    /// Average power drawn while running, in watts.
    pub power: f64,
    /// Average price while running, per hour.
    pub price: f64,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            executions: DEFAULT_EXECUTIONS,
            min_time: DEFAULT_MIN_TIME,
            avg_time: DEFAULT_AVG_TIME,
            max_time: DEFAULT_MAX_TIME,
            power: DEFAULT_POWER,
            price: DEFAULT_PRICE,
        }
    }
}

impl Profile {
    /// A profile with the default estimates and no executions.
    pub fn new() -> Self {
        Self::default()
    }

    /// A profile with no executions but a known average duration.
    pub fn with_average(avg_time: Timestamp) -> Self {
        Self {
            avg_time,
            ..Self::default()
        }
    }

    pub fn with_power(mut self, power: f64) -> Self {
        self.power = power;
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = price;
        self
    }

    /// Record a single run that took `duration` milliseconds, replacing
    /// any previous statistics.
    pub fn end(&mut self, duration: Timestamp) {
        self.executions = 1;
        self.min_time = duration;
        self.max_time = duration;
        self.avg_time = duration;
    }

    /// Fold one more measured run into the statistics.
    pub fn record_execution(&mut self, duration: Timestamp) {
        let mut single = Profile {
            power: self.power,
            price: self.price,
            ..Profile::default()
        };
        single.end(duration);
        self.accumulate(&single);
    }

    /// Merge another profile using execution-weighted averages.
    pub fn accumulate(&mut self, other: &Profile) {
        if other.executions == 0 {
            return;
        }
        if self.executions == 0 {
            self.min_time = other.min_time;
            self.max_time = other.max_time;
        } else {
            self.min_time = self.min_time.min(other.min_time);
            self.max_time = self.max_time.max(other.max_time);
        }

        let total = self.executions + other.executions;
        let own = self.executions as f64;
        let theirs = other.executions as f64;
        let avg = (self.avg_time as f64 * own + other.avg_time as f64 * theirs) / total as f64;
        self.avg_time = avg.round() as Timestamp;
        self.power = (self.power * own + other.power * theirs) / total as f64;
        self.price = (self.price * own + other.price * theirs) / total as f64;
        self.executions = total;
    }

    /// Energy (mJ) of one average execution.
    pub fn energy_per_run(&self) -> f64 {
        self.power * self.avg_time as f64
    }

    /// Price of one average execution.
    pub fn cost_per_run(&self) -> f64 {
        self.price * self.avg_time as f64
    }

    /// Serializable form of this profile.
    pub fn to_record(&self) -> ProfileRecord {
        ProfileRecord {
            executions: Some(self.executions),
            min_time: Some(self.min_time),
            avg_time: Some(self.avg_time),
            max_time: Some(self.max_time),
            power: Some(self.power),
            price: Some(self.price),
        }
    }

    /// Build a profile from a record; missing keys take their defaults.
    pub fn from_record(record: &ProfileRecord) -> Self {
        Self {
            executions: record.executions.unwrap_or(DEFAULT_EXECUTIONS),
            min_time: record.min_time.unwrap_or(DEFAULT_MIN_TIME),
            avg_time: record.avg_time.unwrap_or(DEFAULT_AVG_TIME),
            max_time: record.max_time.unwrap_or(DEFAULT_MAX_TIME),
            power: record.power.unwrap_or(DEFAULT_POWER),
            price: record.price.unwrap_or(DEFAULT_PRICE),
        }
    }

    /// Build a profile from its JSON record.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let record: ProfileRecord = serde_json::from_str(json)?;
        Ok(Self::from_record(&record))
    }

    /// Overwrite `record` with this profile and return what changed.
    ///
    /// The returned record describes only the executions added since the
    /// record was last written: their count and their average time.
    pub fn update_record(&self, record: &mut ProfileRecord) -> ProfileRecord {
        let old = Profile::from_record(record);
        let new_runs = self.executions.saturating_sub(old.executions);
        let avg_time = if new_runs > 0 {
            let total_new = self.avg_time as f64 * self.executions as f64;
            let total_old = old.avg_time as f64 * old.executions as f64;
            ((total_new - total_old) / new_runs as f64).round() as Timestamp
        } else {
            0
        };

        *record = self.to_record();

        ProfileRecord {
            executions: Some(new_runs),
            min_time: Some(self.min_time),
            avg_time: Some(avg_time),
            max_time: Some(self.max_time),
            power: Some(self.power),
            price: Some(self.price),
        }
    }

    /// Merge this profile into an existing record.
    pub fn accumulate_record(&self, record: &mut ProfileRecord) {
        let mut merged = Profile::from_record(record);
        merged.accumulate(self);
        *record = merged.to_record();
    }
}

/// Key/value form of a profile. Missing keys mean "default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

impl ProfileRecord {
    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Record for a whole worker (or instance type): idle rates plus one
/// profile per implementation signature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_power: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_price: Option<f64>,
    #[serde(default)]
    pub implementations: BTreeMap<String, ProfileRecord>,
}

impl WorkerRecord {
    /// Write `new` over `self` and return the per-field difference.
    ///
    /// Idle rates diff as `new - old`; implementation profiles diff with
    /// the same rule as `Profile::update_record`.
    pub fn update(&mut self, new: &WorkerRecord) -> WorkerRecord {
        let diff_field = |old: Option<f64>, new: Option<f64>| match (old, new) {
            (_, None) => None,
            (None, Some(n)) => Some(n),
            (Some(o), Some(n)) => Some(n - o),
        };
        let mut diff = WorkerRecord {
            idle_power: diff_field(self.idle_power, new.idle_power),
            idle_price: diff_field(self.idle_price, new.idle_price),
            implementations: BTreeMap::new(),
        };
        if new.idle_power.is_some() {
            self.idle_power = new.idle_power;
        }
        if new.idle_price.is_some() {
            self.idle_price = new.idle_price;
        }

        for (signature, record) in &new.implementations {
            let profile = Profile::from_record(record);
            let own = self.implementations.entry(signature.clone()).or_default();
            diff.implementations
                .insert(signature.clone(), profile.update_record(own));
        }
        diff
    }

    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_values() {
        let p = Profile::new();
        assert_eq!(p.executions, 0);
        assert_eq!(p.avg_time, 100);
        assert_eq!(p.min_time, i64::MAX);
        assert_eq!(p.max_time, i64::MIN);
    }

    #[test]
    fn test_accumulate_into_empty_takes_bounds() {
        let mut p = Profile::new();
        let mut run = Profile::new();
        run.end(40);
        p.accumulate(&run);
        assert_eq!((p.executions, p.min_time, p.avg_time, p.max_time), (1, 40, 40, 40));
    }

    #[test]
    fn test_accumulate_weights_by_executions() {
        let mut a = Profile::new();
        a.end(100);
        a.record_execution(100);
        a.record_execution(100);
        let mut b = Profile::new();
        b.end(500);

        a.accumulate(&b);

        assert_eq!(a.executions, 4);
        assert_eq!(a.avg_time, 200);
        assert_eq!(a.min_time, 100);
        assert_eq!(a.max_time, 500);
    }

    #[test]
    fn test_accumulate_ignores_empty_other() {
        let mut a = Profile::with_average(70);
        a.accumulate(&Profile::new());
        assert_eq!(a, Profile::with_average(70));
    }

    #[test]
    fn test_record_missing_keys_take_defaults() {
        let p = Profile::from_json(r#"{"avgTime": 250}"#).unwrap();
        assert_eq!(p.avg_time, 250);
        assert_eq!(p.executions, 0);
        assert_eq!(p.min_time, i64::MAX);
    }

    #[test]
    fn test_record_uses_camel_case_keys() {
        let json = Profile::with_average(10).to_record().to_json().unwrap();
        assert!(json.contains("\"avgTime\":10"));
        assert!(json.contains("\"minTime\""));
    }

    #[test]
    fn test_update_record_returns_diff_of_new_runs() {
        let mut old = Profile::new();
        old.end(100);
        old.record_execution(100);
        let mut record = old.to_record();

        let mut new = old;
        new.record_execution(400);
        new.record_execution(400);

        let diff = new.update_record(&mut record);

        assert_eq!(diff.executions, Some(2));
        assert_eq!(diff.avg_time, Some(400));
        assert_eq!(record, new.to_record());
    }

    #[test]
    fn test_update_record_without_new_runs_has_zero_avg() {
        let p = Profile::with_average(30);
        let mut record = p.to_record();
        let diff = p.update_record(&mut record);
        assert_eq!(diff.executions, Some(0));
        assert_eq!(diff.avg_time, Some(0));
    }

    #[test]
    fn test_accumulate_record_merges() {
        let mut first = Profile::new();
        first.end(10);
        let mut record = first.to_record();
        let mut second = Profile::new();
        second.end(30);

        second.accumulate_record(&mut record);

        let merged = Profile::from_record(&record);
        assert_eq!(merged.executions, 2);
        assert_eq!(merged.avg_time, 20);
    }

    #[test]
    fn test_worker_record_diff_is_new_minus_old() {
        let mut stored = WorkerRecord {
            idle_power: Some(10.0),
            idle_price: Some(0.5),
            implementations: BTreeMap::new(),
        };
        let mut run = Profile::new();
        run.end(50);
        let mut update = WorkerRecord {
            idle_power: Some(12.0),
            idle_price: None,
            implementations: BTreeMap::new(),
        };
        update.implementations.insert("sum".into(), run.to_record());

        let diff = stored.update(&update);

        assert_eq!(diff.idle_power, Some(2.0));
        assert_eq!(diff.idle_price, None);
        assert_eq!(stored.idle_power, Some(12.0));
        assert_eq!(stored.idle_price, Some(0.5));
        assert_eq!(diff.implementations["sum"].executions, Some(1));
        assert_eq!(diff.implementations["sum"].avg_time, Some(50));

        let json = stored.to_json().unwrap();
        assert!(json.contains("idlePower"));
        assert_eq!(WorkerRecord::from_json(&json).unwrap(), stored);
    }
}
