//! Job parameters and run identity.
//!
//! A run is identified by its job name plus the canonical form of its
//! parameters. The trigger makes every scheduled run distinct by bumping
//! `run.id` and stamping `launchDate`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use eruna_core::Result;
use serde::{Deserialize, Serialize};

use crate::ledger::ExecutionLedger;

pub const RUN_ID_KEY: &str = "run.id";
pub const LAUNCH_DATE_KEY: &str = "launchDate";
/// Optional day-of-week token overriding the clock.
pub const DAY_KEY: &str = "day";

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParamValue {
    String(String),
    Long(i64),
    Double(f64),
    Date(DateTime<Utc>),
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::String(s) => write!(f, "{s}"),
            ParamValue::Long(n) => write!(f, "{n}"),
            ParamValue::Double(x) => write!(f, "{x}"),
            ParamValue::Date(d) => write!(f, "{}", d.to_rfc3339()),
        }
    }
}

/// Ordered parameter map. Key order is fixed, so the serialized form is canonical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters {
    values: BTreeMap<String, ParamValue>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: ParamValue) -> Option<ParamValue> {
        self.values.insert(key.to_string(), value)
    }

    pub fn with_string(mut self, key: &str, value: &str) -> Self {
        self.insert(key, ParamValue::String(value.to_string()));
        self
    }

    pub fn with_long(mut self, key: &str, value: i64) -> Self {
        self.insert(key, ParamValue::Long(value));
        self
    }

    pub fn with_double(mut self, key: &str, value: f64) -> Self {
        self.insert(key, ParamValue::Double(value));
        self
    }

    pub fn with_date(mut self, key: &str, value: DateTime<Utc>) -> Self {
        self.insert(key, ParamValue::Date(value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(ParamValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(ParamValue::Long(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_date(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.values.get(key) {
            Some(ParamValue::Date(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Canonical identity string: two parameter sets name the same run
    /// instance exactly when their keys are equal.
    pub fn identity_key(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.values)?)
    }
}

/// The two parameters that make a scheduled run unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunIdentity {
    pub run_id: i64,
    pub launch_date: DateTime<Utc>,
}

impl RunIdentity {
    pub fn to_parameters(&self) -> JobParameters {
        JobParameters::new()
            .with_long(RUN_ID_KEY, self.run_id)
            .with_date(LAUNCH_DATE_KEY, self.launch_date)
    }
}

/// Hands out `run.id = max(previous run.id) + 1` per job.
pub struct RunIdIncrementer {
    ledger: Arc<ExecutionLedger>,
}

impl RunIdIncrementer {
    pub fn new(ledger: Arc<ExecutionLedger>) -> Self {
        Self { ledger }
    }

    pub fn next(&self, job_name: &str, launch_date: DateTime<Utc>) -> Result<RunIdentity> {
        let run_id = self.ledger.max_run_id(job_name)?.unwrap_or(0) + 1;
        Ok(RunIdentity {
            run_id,
            launch_date,
        })
    }
}
