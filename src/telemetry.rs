//! Process metrics as an explicit handle.
//!
//! One `Telemetry` value is constructed by the application and cloned into
//! every component; there is no process-wide singleton. Tests pass
//! [`Telemetry::disabled`] to get a no-op sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default)]
pub struct Telemetry {
    gauges: Option<Arc<Mutex<HashMap<String, f64>>>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            gauges: Some(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    /// A sink that records nothing
    pub fn disabled() -> Self {
        Self { gauges: None }
    }

    /// Get or create a named gauge
    pub fn gauge(&self, name: &str) -> Gauge {
        Gauge {
            name: name.to_owned(),
            gauges: self.gauges.clone(),
        }
    }

    /// Current value of a gauge, 0 when never touched or disabled
    pub fn value(&self, name: &str) -> f64 {
        self.gauges
            .as_ref()
            .and_then(|g| g.lock().ok().and_then(|map| map.get(name).copied()))
            .unwrap_or(0.0)
    }
}

/// A named counter/gauge, internally locked
#[derive(Clone, Debug)]
pub struct Gauge {
    name: String,
    gauges: Option<Arc<Mutex<HashMap<String, f64>>>>,
}

impl Gauge {
    pub fn increment(&self) {
        self.add(1.0);
    }

    pub fn add(&self, value: f64) {
        if let Some(gauges) = &self.gauges {
            if let Ok(mut map) = gauges.lock() {
                *map.entry(self.name.clone()).or_insert(0.0) += value;
            }
        }
    }

    pub fn set(&self, value: f64) {
        if let Some(gauges) = &self.gauges {
            if let Ok(mut map) = gauges.lock() {
                map.insert(self.name.clone(), value);
            }
        }
    }

    pub fn value(&self) -> f64 {
        self.gauges
            .as_ref()
            .and_then(|g| g.lock().ok().and_then(|map| map.get(&self.name).copied()))
            .unwrap_or(0.0)
    }
}
