use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::{
    fmt::Write,
    sync::{Arc, Mutex},
};

/// Why an idle connection left its bucket.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub(crate) enum Reason {
    PeerClosed,
    Expired,
    Evicted,
}

impl EncodeLabelValue for Reason {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        match self {
            Reason::PeerClosed => encoder.write_str("peer_closed"),
            Reason::Expired => encoder.write_str("expired"),
            Reason::Evicted => encoder.write_str("evicted"),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct Removal {
    pub reason: Reason,
}

#[derive(Debug)]
pub(crate) struct Metrics {
    pub dialed: Counter,
    pub reused: Counter,
    pub recycled: Counter,
    pub removed: Family<Removal, Counter>,
    pub live: Gauge,
    pub idle: Gauge,
}

impl Metrics {
    pub fn init(registry: Arc<Mutex<Registry>>) -> Self {
        let metrics = Self {
            dialed: Counter::default(),
            reused: Counter::default(),
            recycled: Counter::default(),
            removed: Family::default(),
            live: Gauge::default(),
            idle: Gauge::default(),
        };
        {
            let mut registry = registry.lock().unwrap();
            registry.register(
                "connections_dialed",
                "Number of fresh connections dialed",
                metrics.dialed.clone(),
            );
            registry.register(
                "connections_reused",
                "Number of dials served by an idle connection",
                metrics.reused.clone(),
            );
            registry.register(
                "connections_recycled",
                "Number of connections returned to the idle store",
                metrics.recycled.clone(),
            );
            registry.register(
                "connections_removed",
                "Number of idle connections removed, by reason",
                metrics.removed.clone(),
            );
            registry.register(
                "connections_live",
                "Number of live connections (in use or idle)",
                metrics.live.clone(),
            );
            registry.register(
                "connections_idle",
                "Number of idle connections currently seated",
                metrics.idle.clone(),
            );
        }
        metrics
    }
}
