//! Prometheus export of registry metrics.

use crate::core::RegistryMetrics;
use crate::error::{AnvilError, AnvilResult};
use prometheus::{Gauge, IntGauge, Opts, Registry};

/// Prometheus gauges mirroring a [`RegistryMetrics`] snapshot.
///
/// # Examples
///
/// ```rust
/// use anvilq::metrics::AnvilMetrics;
/// use anvilq::RegistryMetrics;
///
/// let prometheus = prometheus::Registry::new();
/// let metrics = AnvilMetrics::register(&prometheus, "orders").unwrap();
/// metrics.observe(&RegistryMetrics::default());
/// ```
pub struct AnvilMetrics {
    members: IntGauge,
    active_members: IntGauge,
    queue_length_total: IntGauge,
    queue_length_max: IntGauge,
    queue_length_average: Gauge,
    workers: IntGauge,
}

impl AnvilMetrics {
    /// Create the gauges, labelled with the registry name, and register them.
    pub fn register(registry: &Registry, name: &str) -> AnvilResult<Self> {
        let opts = |metric: &str, help: &str| {
            Opts::new(metric, help).const_label("registry", name)
        };

        let metrics = Self {
            members: IntGauge::with_opts(opts("anvilq_members", "Mapped keys"))
                .map_err(prometheus_error)?,
            active_members: IntGauge::with_opts(opts(
                "anvilq_active_members",
                "Members with a running engine",
            ))
            .map_err(prometheus_error)?,
            queue_length_total: IntGauge::with_opts(opts(
                "anvilq_active_queue_length_total",
                "Items pending across running members",
            ))
            .map_err(prometheus_error)?,
            queue_length_max: IntGauge::with_opts(opts(
                "anvilq_active_queue_length_max",
                "Longest pending queue among running members",
            ))
            .map_err(prometheus_error)?,
            queue_length_average: Gauge::with_opts(opts(
                "anvilq_active_queue_length_average",
                "Mean pending queue length among running members",
            ))
            .map_err(prometheus_error)?,
            workers: IntGauge::with_opts(opts(
                "anvilq_workers_total",
                "Dispatches in flight across all members",
            ))
            .map_err(prometheus_error)?,
        };

        registry
            .register(Box::new(metrics.members.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(metrics.active_members.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(metrics.queue_length_total.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(metrics.queue_length_max.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(metrics.queue_length_average.clone()))
            .map_err(prometheus_error)?;
        registry
            .register(Box::new(metrics.workers.clone()))
            .map_err(prometheus_error)?;

        Ok(metrics)
    }

    /// Update every gauge from a snapshot.
    pub fn observe(&self, snapshot: &RegistryMetrics) {
        self.members.set(snapshot.member_count as i64);
        self.active_members.set(snapshot.active_member_count as i64);
        self.queue_length_total
            .set(snapshot.active_member_queue_total_length as i64);
        self.queue_length_max
            .set(snapshot.active_member_queue_max_length as i64);
        self.queue_length_average
            .set(snapshot.active_member_queue_average_length);
        self.workers.set(snapshot.total_worker_count as i64);
    }
}

fn prometheus_error(e: prometheus::Error) -> AnvilError {
    AnvilError::config(format!("Prometheus registration failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_updates_gauges() {
        let prometheus = Registry::new();
        let metrics = AnvilMetrics::register(&prometheus, "R").unwrap();

        metrics.observe(&RegistryMetrics {
            member_count: 3,
            active_member_count: 2,
            active_member_queue_average_length: 1.5,
            active_member_queue_max_length: 2,
            active_member_queue_total_length: 3,
            total_worker_count: 2,
        });

        let families = prometheus.gather();
        assert_eq!(families.len(), 6);

        let text = prometheus::TextEncoder::new()
            .encode_to_string(&families)
            .unwrap();
        assert!(text.contains("anvilq_members{registry=\"R\"} 3"));
        assert!(text.contains("anvilq_active_queue_length_average{registry=\"R\"} 1.5"));
    }

    #[test]
    fn test_double_registration_fails() {
        let prometheus = Registry::new();
        assert!(AnvilMetrics::register(&prometheus, "R").is_ok());
        assert!(AnvilMetrics::register(&prometheus, "R").is_err());
    }
}
