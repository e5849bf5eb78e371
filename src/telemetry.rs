//! Telemetry thresholds.
//!
//! Server and client each build [`PerformanceMetrics`] from their own
//! statistics. [`MetricsThresholds`] checks a sample and reports what is out
//! of range; how breaches are surfaced is left to the event sink.

use serde::{Deserialize, Serialize};

use crate::game::events::{NetcodeEvent, SharedSink};
use crate::network::protocol::PerformanceMetrics;

/// A threshold a sample violated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breach {
    /// Threshold name
    pub name: &'static str,
    /// Observed value
    pub value: f32,
    /// Configured limit
    pub limit: f32,
}

/// Alerting limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsThresholds {
    /// Longest acceptable mean tick (ms)
    pub max_tick_ms: f32,
    /// Lowest acceptable compression ratio
    pub min_compression_ratio: f32,
    /// Lowest acceptable prediction accuracy
    pub min_prediction_accuracy: f32,
    /// Largest acceptable mean rollback error (cells)
    pub max_avg_rollback_error: f32,
    /// Highest acceptable latency (ms)
    pub max_latency_ms: f32,
}

impl Default for MetricsThresholds {
    fn default() -> Self {
        Self {
            max_tick_ms: 16.0,
            min_compression_ratio: 0.5,
            min_prediction_accuracy: 0.8,
            max_avg_rollback_error: 3.0,
            max_latency_ms: 150.0,
        }
    }
}

impl MetricsThresholds {
    /// Every threshold the sample breaches.
    ///
    /// Compression is only judged once deltas have been sent, and latency
    /// once a round trip has been measured.
    pub fn evaluate(&self, metrics: &PerformanceMetrics) -> Vec<Breach> {
        let mut breaches = Vec::new();
        let mut above = |name, value: f32, limit: f32| {
            if value > limit {
                breaches.push(Breach { name, value, limit });
            }
        };
        above("avg_tick_ms", metrics.avg_tick_ms, self.max_tick_ms);
        above("avg_rollback_error", metrics.avg_rollback_error, self.max_avg_rollback_error);
        if metrics.latency_ms > 0.0 {
            above("latency_ms", metrics.latency_ms, self.max_latency_ms);
        }

        if metrics.bytes_sent > 0 && metrics.compression_ratio_avg < self.min_compression_ratio {
            breaches.push(Breach {
                name: "compression_ratio_avg",
                value: metrics.compression_ratio_avg,
                limit: self.min_compression_ratio,
            });
        }
        if metrics.prediction_accuracy < self.min_prediction_accuracy {
            breaches.push(Breach {
                name: "prediction_accuracy",
                value: metrics.prediction_accuracy,
                limit: self.min_prediction_accuracy,
            });
        }
        breaches
    }

    /// Evaluate and emit a `ThresholdBreached` event per breach.
    pub fn report(&self, metrics: &PerformanceMetrics, sink: &SharedSink) -> Vec<Breach> {
        let breaches = self.evaluate(metrics);
        for b in &breaches {
            sink.emit(NetcodeEvent::ThresholdBreached {
                name: b.name.to_string(),
                value: b.value,
                limit: b.limit,
            });
        }
        breaches
    }
}

/// Merge a server sample with the client's own view.
///
/// Server fields come from `server`; prediction, rollback, rendering and
/// latency fields from `client`. The newer timestamp wins.
pub fn combine(server: &PerformanceMetrics, client: &PerformanceMetrics) -> PerformanceMetrics {
    PerformanceMetrics {
        timestamp: server.timestamp.max(client.timestamp),
        prediction_accuracy: client.prediction_accuracy,
        rollback_count: client.rollback_count,
        avg_rollback_error: client.avg_rollback_error,
        interpolation_tasks: client.interpolation_tasks,
        snapshot_buffer_len: client.snapshot_buffer_len,
        latency_ms: client.latency_ms,
        frame_time_ms: client.frame_time_ms,
        dropped_snapshots: client.dropped_snapshots,
        ..server.clone()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::game::events::EventLog;

    fn healthy() -> PerformanceMetrics {
        PerformanceMetrics {
            avg_tick_ms: 4.0,
            bytes_sent: 10_000,
            compression_ratio_avg: 0.85,
            prediction_accuracy: 0.97,
            avg_rollback_error: 0.4,
            latency_ms: 40.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_healthy_sample_passes() {
        assert!(MetricsThresholds::default().evaluate(&healthy()).is_empty());
    }

    #[test]
    fn test_each_breach_reported() {
        let thresholds = MetricsThresholds::default();
        let mut m = healthy();
        m.avg_tick_ms = 22.0;
        m.compression_ratio_avg = 0.1;
        m.prediction_accuracy = 0.5;
        m.avg_rollback_error = 6.0;
        m.latency_ms = 300.0;

        let mut names: Vec<&str> = thresholds.evaluate(&m).iter().map(|b| b.name).collect();
        names.sort_unstable();
        assert_eq!(
            names,
            vec!["avg_rollback_error", "avg_tick_ms", "compression_ratio_avg", "latency_ms", "prediction_accuracy"]
        );
    }

    #[test]
    fn test_unmeasured_fields_not_judged() {
        let m = PerformanceMetrics {
            prediction_accuracy: 1.0,
            ..Default::default()
        };
        assert!(MetricsThresholds::default().evaluate(&m).is_empty());
    }

    #[test]
    fn test_report_emits_events() {
        let log = EventLog::new();
        let sink: SharedSink = Arc::new(log.clone());
        let mut m = healthy();
        m.avg_tick_ms = 40.0;
        let breaches = MetricsThresholds::default().report(&m, &sink);
        assert_eq!(breaches.len(), 1);
        assert_eq!(log.count("threshold_breached"), 1);
    }

    #[test]
    fn test_combine_takes_each_side() {
        let server = PerformanceMetrics {
            timestamp: 100,
            tick_rate: 20.0,
            bytes_sent: 500,
            prediction_accuracy: 0.0,
            ..Default::default()
        };
        let client = PerformanceMetrics {
            timestamp: 120,
            prediction_accuracy: 0.9,
            latency_ms: 30.0,
            tick_rate: 0.0,
            ..Default::default()
        };
        let merged = combine(&server, &client);
        assert_eq!(merged.timestamp, 120);
        assert_eq!(merged.tick_rate, 20.0);
        assert_eq!(merged.bytes_sent, 500);
        assert_eq!(merged.prediction_accuracy, 0.9);
        assert_eq!(merged.latency_ms, 30.0);
    }
}
