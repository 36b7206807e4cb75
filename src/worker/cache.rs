use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::device::{AttrValue, AttributeReading, DeviceState};

/// One polled attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribute {
    pub value: AttrValue,
    pub last_updated: DateTime<Utc>,
}

/// Immutable view of the most recently polled device values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub attributes: HashMap<String, Attribute>,
    /// Run state from the low-frequency auxiliary read.
    pub device_state: Option<DeviceState>,
    /// Status string from the low-frequency auxiliary read.
    pub device_status: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl StatusSnapshot {
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name).map(|a| &a.value)
    }
}

/// Single-writer, many-reader store of [`StatusSnapshot`]s.
///
/// The worker builds a fresh snapshot per cycle and publishes it whole;
/// readers only ever see `Arc`s of published values.
#[derive(Debug)]
pub struct StatusCache {
    tx: watch::Sender<Option<Arc<StatusSnapshot>>>,
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCache {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn snapshot(&self) -> Option<Arc<StatusSnapshot>> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<StatusSnapshot>>> {
        self.tx.subscribe()
    }

    /// Merge successful readings over the current snapshot and publish.
    /// Failed readings keep their previous value. Returns the number of
    /// attributes that were read successfully.
    pub fn merge_readings(&self, readings: Vec<AttributeReading>) -> usize {
        let now = Utc::now();
        let mut next = self.current();
        let mut successes = 0;

        for reading in readings {
            if let Ok(value) = reading.result {
                successes += 1;
                next.attributes.insert(
                    reading.name,
                    Attribute {
                        value,
                        last_updated: now,
                    },
                );
            }
        }

        if successes > 0 {
            next.published_at = Some(now);
            self.tx.send_replace(Some(Arc::new(next)));
        }
        successes
    }

    /// Merge the auxiliary device state/status read.
    pub fn merge_device_status(&self, state: Option<DeviceState>, status: Option<String>) {
        if state.is_none() && status.is_none() {
            return;
        }
        let mut next = self.current();
        if state.is_some() {
            next.device_state = state;
        }
        if status.is_some() {
            next.device_status = status;
        }
        next.published_at = Some(Utc::now());
        self.tx.send_replace(Some(Arc::new(next)));
    }

    fn current(&self) -> StatusSnapshot {
        self.tx
            .borrow()
            .as_deref()
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Scalar;

    fn float(v: f64) -> AttrValue {
        AttrValue::Scalar(Scalar::Float(v))
    }

    #[test]
    fn empty_until_first_success() {
        let cache = StatusCache::new();
        assert!(cache.snapshot().is_none());

        let n = cache.merge_readings(vec![AttributeReading::err("position", "timeout")]);
        assert_eq!(n, 0);
        assert!(cache.snapshot().is_none());
    }

    #[test]
    fn failed_readings_keep_last_good_value() {
        let cache = StatusCache::new();
        cache.merge_readings(vec![
            AttributeReading::ok("position", float(1.0)),
            AttributeReading::ok("velocity", float(2.0)),
        ]);

        let n = cache.merge_readings(vec![
            AttributeReading::ok("position", float(5.0)),
            AttributeReading::err("velocity", "read failed"),
        ]);
        assert_eq!(n, 1);

        let snap = cache.snapshot().unwrap();
        assert_eq!(snap.get("position"), Some(&float(5.0)));
        assert_eq!(snap.get("velocity"), Some(&float(2.0)));
    }

    #[test]
    fn published_snapshots_are_not_mutated_by_later_cycles() {
        let cache = StatusCache::new();
        cache.merge_readings(vec![AttributeReading::ok("position", float(1.0))]);
        let held = cache.snapshot().unwrap();

        cache.merge_readings(vec![AttributeReading::ok("position", float(9.0))]);

        assert_eq!(held.get("position"), Some(&float(1.0)));
        assert_eq!(cache.snapshot().unwrap().get("position"), Some(&float(9.0)));
    }

    #[test]
    fn device_status_lives_beside_attributes() {
        let cache = StatusCache::new();
        cache.merge_readings(vec![AttributeReading::ok("position", float(1.0))]);
        cache.merge_device_status(Some(DeviceState::On), Some("ready".into()));

        let snap = cache.snapshot().unwrap();
        assert_eq!(snap.device_state, Some(DeviceState::On));
        assert_eq!(snap.device_status.as_deref(), Some("ready"));
        assert_eq!(snap.attributes.len(), 1);
    }

    #[tokio::test]
    async fn subscribers_see_new_snapshots() {
        let cache = StatusCache::new();
        let mut rx = cache.subscribe();
        cache.merge_readings(vec![AttributeReading::ok("position", float(3.0))]);

        rx.changed().await.unwrap();
        let snap = rx.borrow_and_update().clone().unwrap();
        assert_eq!(snap.get("position"), Some(&float(3.0)));
    }
}
