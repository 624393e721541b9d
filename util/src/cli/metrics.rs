use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Once;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Listen address of metrics. Used by the client to gather prometheus metrics.
    /// Default: `127.0.0.1:10000`
    #[serde(with = "crate::serde_helpers::string")]
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 10000),
        }
    }
}

/// Initializes the prometheus exporter once.
///
/// All invocations after the successful initialization will fail.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
    use metrics_exporter_prometheus::Matcher;

    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.0001, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
        30.0, 60.0, 120.0,
    ];

    static ONCE: Once = Once::new();

    let mut result = None;
    ONCE.call_once(|| {
        result = Some((|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .set_buckets_for_metric(Matcher::Suffix("_time".to_string()), EXPONENTIAL_SECONDS)?
                .with_http_listener(config.listen_addr)
                .install()
                .context("failed to initialize a metrics exporter")
        })());
    });

    match result {
        Some(res) => res,
        None => anyhow::bail!("metrics exporter was already initialized"),
    }
}
