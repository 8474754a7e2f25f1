use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counters for the destination gRPC server.
#[derive(Clone, Debug)]
pub struct ServerMetrics {
    started: Family<Labels, Counter>,
    updates: Family<Labels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Labels {
    grpc_method: &'static str,
}

// === impl ServerMetrics ===

impl ServerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let started = Family::<Labels, Counter>::default();
        reg.register(
            "streams_started",
            "The number of destination streams opened on the server",
            started.clone(),
        );

        let updates = Family::<Labels, Counter>::default();
        reg.register(
            "updates_sent",
            "The number of update messages sent on destination streams",
            updates.clone(),
        );

        Self { started, updates }
    }

    pub(crate) fn stream_started(&self, grpc_method: &'static str) {
        self.started.get_or_create(&Labels { grpc_method }).inc();
    }

    /// A counter incremented for each message sent on a stream.
    pub(crate) fn updates(&self, grpc_method: &'static str) -> Counter {
        self.updates.get_or_create(&Labels { grpc_method }).clone()
    }
}
