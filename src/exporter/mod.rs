//! The collector surface invoked once per scrape, on top of the `prometheus`
//! client registry.

#![allow(missing_docs)]

pub mod text;

use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, Opts, Registry};

use crate::core::errors::Result;

/// A source of metrics refreshed on every scrape.
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register and fill this scrape's metric families. An `Err` means the
    /// whole collector failed for this scrape; partial per-item failures are
    /// reported as data.
    fn update(&self, registry: &Registry) -> Result<()>;
}

/// Create a gauge family and register it in one step.
pub fn register_gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<GaugeVec> {
    let gauges = GaugeVec::new(Opts::new(name, help), label_names)?;
    registry.register(Box::new(gauges.clone()))?;
    Ok(gauges)
}

/// Run `collector` against a fresh registry and gather what it produced.
/// Each scrape starts empty, so series for vanished mounts never linger.
pub fn scrape(collector: &dyn Collector) -> Result<Vec<MetricFamily>> {
    let registry = Registry::new();
    collector.update(&registry)?;
    Ok(registry.gather())
}
