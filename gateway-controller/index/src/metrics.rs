use crate::SharedProvider;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedProvider);

pub fn register(reg: &mut Registry, provider: SharedProvider) {
    reg.register_collector(Box::new(Instrumented(provider)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let snapshot = self.0.get_config();

        let version_encoder = encoder.encode_descriptor(
            "route_snapshot_version",
            "The version of the current route snapshot",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(snapshot.version as i64).encode(version_encoder)?;

        let routes_encoder = encoder.encode_descriptor(
            "route_snapshot_routes",
            "The number of routes in the current route snapshot",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(snapshot.routes.len() as i64).encode(routes_encoder)?;

        let clusters_encoder = encoder.encode_descriptor(
            "route_snapshot_clusters",
            "The number of clusters in the current route snapshot",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(snapshot.clusters.len() as i64).encode(clusters_encoder)?;

        Ok(())
    }
}
