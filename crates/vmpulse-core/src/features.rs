//! Rate-of-change features derived from successive counter samples.
//!
//! The computer keeps one previous-value record per `(vm_id, field)` key.
//! The first observation of a key yields no derived value: absence, not
//! zero, so the sink never sees a made-up rate for a point that has none.

use std::collections::{HashMap, HashSet};
use std::f64::consts::FRAC_PI_2;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::sample::{CounterField, DerivedSample};

/// Compressive transform mapping an unbounded rate to a bounded activity
/// angle in degrees.
///
/// `activity = max_degrees * (2/pi) * atan(log_scale * log10(1 + rate))`
///
/// Guarantees: rate 0 maps to 0, the output is strictly monotone in the
/// rate, and it approaches `max_degrees` asymptotically without reaching it.
/// The log10 stage compresses rates spanning many orders of magnitude
/// (single-digit to multi-gigabyte-per-second counters) before squashing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityTransform {
    /// Upper bound of the output range, asymptotic.
    pub max_degrees: f64,
    /// Gain applied to the log-compressed rate before squashing.
    pub log_scale: f64,
    /// Rates at or below this floor map to exactly 0.
    pub epsilon: f64,
}

impl Default for ActivityTransform {
    fn default() -> Self {
        Self {
            max_degrees: 90.0,
            log_scale: 1.0,
            epsilon: 1e-12,
        }
    }
}

impl ActivityTransform {
    /// Bounded activity value for a non-negative rate.
    pub fn activity_degrees(&self, rate: f64) -> f64 {
        if !rate.is_finite() || rate <= self.epsilon {
            return 0.0;
        }
        let compressed = self.log_scale * (1.0 + rate).log10();
        self.max_degrees * compressed.atan() / FRAC_PI_2
    }
}

#[derive(Debug, Clone, Copy)]
struct PreviousValue {
    value: f64,
    timestamp: SystemTime,
}

/// Stateful per-(VM, field) rate computer.
///
/// Owned by the poll loop; nothing else mutates it. Readers that need
/// current derived values go through the collector's cycle snapshot.
pub struct RateFeatureComputer {
    transform: ActivityTransform,
    prev: HashMap<(u32, CounterField), PreviousValue>,
}

impl RateFeatureComputer {
    pub fn new(transform: ActivityTransform) -> Self {
        Self {
            transform,
            prev: HashMap::new(),
        }
    }

    /// Feed one observation; returns a derived sample from the second
    /// observation of a key onward.
    ///
    /// A non-positive time delta is a degenerate sample: skipped, and the
    /// stored record is left untouched. A negative value delta means the
    /// counter wrapped or the VM restarted: the rate clamps to 0 and the
    /// record is still updated.
    pub fn compute(
        &mut self,
        vm_id: u32,
        field: CounterField,
        raw_value: f64,
        timestamp: SystemTime,
    ) -> Option<DerivedSample> {
        let key = (vm_id, field);
        let Some(prev) = self.prev.get(&key) else {
            self.prev.insert(key, PreviousValue { value: raw_value, timestamp });
            return None;
        };

        let dt_s = match timestamp.duration_since(prev.timestamp) {
            Ok(d) => d.as_secs_f64(),
            Err(_) => return None,
        };
        if dt_s <= 0.0 {
            return None;
        }

        let delta = raw_value - prev.value;
        let rate = if delta < 0.0 { 0.0 } else { delta / dt_s };

        self.prev.insert(key, PreviousValue { value: raw_value, timestamp });

        Some(DerivedSample {
            vm_id,
            field,
            rate,
            activity_deg: self.transform.activity_degrees(rate),
            timestamp,
        })
    }

    /// Drop records for VMs absent from the current cycle.
    pub fn retain_vms(&mut self, live: &HashSet<u32>) {
        self.prev.retain(|(vm_id, _), _| live.contains(vm_id));
    }

    /// Number of tracked `(vm_id, field)` keys.
    pub fn tracked_keys(&self) -> usize {
        self.prev.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn ts_at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn computer() -> RateFeatureComputer {
        RateFeatureComputer::new(ActivityTransform::default())
    }

    // -----------------------------------------------------------------------
    // Cold start / steady state
    // -----------------------------------------------------------------------

    #[test]
    fn test_first_observation_yields_nothing_and_caches() {
        let mut c = computer();
        let out = c.compute(1, CounterField::MemUsedKb, 1000.0, ts_at(100));
        assert!(out.is_none());
        assert_eq!(c.tracked_keys(), 1);
    }

    #[test]
    fn test_second_observation_yields_rate() {
        let mut c = computer();
        assert!(c.compute(1, CounterField::MemUsedKb, 4_194_304.0, ts_at(100)).is_none());
        let d = c
            .compute(1, CounterField::MemUsedKb, 4_236_783.0, ts_at(102))
            .unwrap();
        // (4236783 - 4194304) / 2 = 21239.5
        assert_eq!(d.rate, 21239.5);
        assert!(d.activity_deg > 0.0 && d.activity_deg < 90.0);
        assert_eq!(d.timestamp, ts_at(102));
    }

    #[test]
    fn test_keys_are_independent_per_vm_and_field() {
        let mut c = computer();
        assert!(c.compute(1, CounterField::NetRxBytes, 10.0, ts_at(1)).is_none());
        assert!(c.compute(2, CounterField::NetRxBytes, 10.0, ts_at(1)).is_none());
        assert!(c.compute(1, CounterField::NetTxBytes, 10.0, ts_at(1)).is_none());
        assert_eq!(c.tracked_keys(), 3);
        assert!(c.compute(1, CounterField::NetRxBytes, 20.0, ts_at(2)).is_some());
    }

    // -----------------------------------------------------------------------
    // Degenerate samples and counter resets
    // -----------------------------------------------------------------------

    #[test]
    fn test_non_positive_dt_is_skipped_without_update() {
        let mut c = computer();
        assert!(c.compute(1, CounterField::NetRxBytes, 100.0, ts_at(10)).is_none());
        // Same timestamp: degenerate, no output, record unchanged.
        assert!(c.compute(1, CounterField::NetRxBytes, 500.0, ts_at(10)).is_none());
        // Clock moved backwards: same treatment.
        assert!(c.compute(1, CounterField::NetRxBytes, 500.0, ts_at(9)).is_none());
        // Next valid sample still computes against the original record.
        let d = c.compute(1, CounterField::NetRxBytes, 300.0, ts_at(12)).unwrap();
        assert_eq!(d.rate, 100.0); // (300 - 100) / 2
    }

    #[test]
    fn test_counter_reset_clamps_to_zero_and_updates() {
        let mut c = computer();
        assert!(c.compute(1, CounterField::DiskRdBytes, 1_000_000.0, ts_at(10)).is_none());
        let d = c.compute(1, CounterField::DiskRdBytes, 50.0, ts_at(12)).unwrap();
        assert_eq!(d.rate, 0.0);
        assert_eq!(d.activity_deg, 0.0);
        // The reset value became the new baseline.
        let d = c.compute(1, CounterField::DiskRdBytes, 250.0, ts_at(14)).unwrap();
        assert_eq!(d.rate, 100.0);
    }

    // -----------------------------------------------------------------------
    // Activity transform
    // -----------------------------------------------------------------------

    #[test]
    fn test_transform_zero_and_bound() {
        let t = ActivityTransform::default();
        assert_eq!(t.activity_degrees(0.0), 0.0);
        assert_eq!(t.activity_degrees(-5.0), 0.0);
        assert_eq!(t.activity_degrees(f64::NAN), 0.0);
        let huge = t.activity_degrees(1e18);
        assert!(huge < 90.0);
        assert!(huge > 80.0);
    }

    #[test]
    fn test_transform_monotonic_across_magnitudes() {
        let t = ActivityTransform::default();
        let rates = [0.1, 1.0, 10.0, 21_239.5, 1e6, 1e9, 1e12];
        let outs: Vec<f64> = rates.iter().map(|&r| t.activity_degrees(r)).collect();
        for w in outs.windows(2) {
            assert!(w[0] < w[1], "expected strictly increasing: {outs:?}");
        }
    }

    #[test]
    fn test_derived_monotonic_in_delta_at_fixed_dt() {
        // At dt=2s, the derived value for delta=42479 must sit strictly
        // between smaller and larger deltas.
        let mut c = computer();
        let mut derive = |vm: u32, delta: f64| {
            c.compute(vm, CounterField::MemUsedKb, 0.0, ts_at(100));
            c.compute(vm, CounterField::MemUsedKb, delta, ts_at(102))
                .unwrap()
                .activity_deg
        };
        let small = derive(1, 4_000.0);
        let mid = derive(2, 42_479.0);
        let large = derive(3, 400_000.0);
        assert!(small < mid && mid < large);
    }

    // -----------------------------------------------------------------------
    // Stale-VM cleanup
    // -----------------------------------------------------------------------

    #[test]
    fn test_retain_vms_drops_vanished() {
        let mut c = computer();
        c.compute(1, CounterField::NetRxBytes, 1.0, ts_at(1));
        c.compute(2, CounterField::NetRxBytes, 1.0, ts_at(1));
        c.compute(2, CounterField::NetTxBytes, 1.0, ts_at(1));
        assert_eq!(c.tracked_keys(), 3);

        let live: HashSet<u32> = [1].into_iter().collect();
        c.retain_vms(&live);
        assert_eq!(c.tracked_keys(), 1);

        // VM 2 reappearing starts cold again.
        assert!(c.compute(2, CounterField::NetRxBytes, 5.0, ts_at(10)).is_none());
    }
}
