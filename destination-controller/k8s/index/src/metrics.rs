//! Gauges reporting the size of the discovery indexes.

use crate::{endpoints, profiles};
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

pub fn register(reg: &mut Registry, endpoints: endpoints::SharedIndex, profiles: profiles::SharedIndex) {
    reg.register_collector(Box::new(IndexCollector {
        endpoints,
        profiles,
    }));
}

#[derive(Debug)]
struct IndexCollector {
    endpoints: endpoints::SharedIndex,
    profiles: profiles::SharedIndex,
}

impl Collector for IndexCollector {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let (services, pods, watches) = {
            let ix = self.endpoints.read();
            (ix.service_count(), ix.pod_count(), ix.endpoint_watch_count())
        };
        let profile_watches = self.profiles.read().profile_watch_count();

        let gauge = ConstGauge::new(services as i64);
        gauge.encode(encoder.encode_descriptor(
            "services",
            "The number of indexed services",
            None,
            MetricType::Gauge,
        )?)?;

        let gauge = ConstGauge::new(pods as i64);
        gauge.encode(encoder.encode_descriptor(
            "pods",
            "The number of indexed pods",
            None,
            MetricType::Gauge,
        )?)?;

        let gauge = ConstGauge::new(watches as i64);
        gauge.encode(encoder.encode_descriptor(
            "endpoint_watches",
            "The number of active endpoint and opaque-ports subscriptions",
            None,
            MetricType::Gauge,
        )?)?;

        let gauge = ConstGauge::new(profile_watches as i64);
        gauge.encode(encoder.encode_descriptor(
            "profile_watches",
            "The number of active profile subscriptions",
            None,
            MetricType::Gauge,
        )?)?;

        Ok(())
    }
}
