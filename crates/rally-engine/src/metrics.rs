//! Engine metrics

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus counters and gauges of one engine instance
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,

    pub events_received: IntCounter,
    pub duplicates: IntCounter,
    /// Rejections by reason label (`per_minute`, `repeated_char`, `repeated_content`, ...)
    pub rejected: IntCounterVec,
    pub short_messages: IntCounter,
    pub not_linked: IntCounter,
    pub punished_events: IntCounter,
    pub xp_queued: IntCounter,
    pub flushes_ok: IntCounter,
    pub flushes_failed: IntCounter,
    pub entries_requeued: IntCounter,
    pub entries_dropped: IntCounter,
    pub breaker_rejections: IntCounter,
    pub breaker_state: IntGauge,
    pub level_ups: IntCounter,
    pub punishments: IntCounter,
    pub invites_rewarded: IntCounter,
    pub invites_rejected: IntCounter,
    pub invites_abandoned: IntCounter,
    pub deferred_joins: IntGauge,
    pub queue_depth: IntGauge,
    pub cache_entries: IntGauge,
}

impl EngineMetrics {
    /// Metrics registered in a fresh registry
    pub fn new(platform: &str) -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new(), platform)
    }

    /// Metrics registered in `registry`, every series labelled with
    /// `platform` so several engines can share one registry
    pub fn with_registry(registry: Registry, platform: &str) -> Result<Self, prometheus::Error> {
        let opts = |name: &str, help: &str| {
            Opts::new(format!("rally_{}", name), help).const_label("platform", platform)
        };
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::with_opts(opts(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let g = IntGauge::with_opts(opts(name, help))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        let rejected = IntCounterVec::new(
            opts("messages_rejected_total", "Messages refused by the anti-abuse gate"),
            &["reason"],
        )?;
        registry.register(Box::new(rejected.clone()))?;

        Ok(Self {
            events_received: counter("events_received_total", "Chat messages received")?,
            duplicates: counter("events_duplicate_total", "Messages dropped as duplicates")?,
            rejected,
            short_messages: counter("messages_short_total", "Messages below the XP length floor")?,
            not_linked: counter("messages_not_linked_total", "Messages from users without a linked account")?,
            punished_events: counter("messages_during_restriction_total", "Messages from restricted users")?,
            xp_queued: counter("xp_queued_total", "XP added to the batch accumulator")?,
            flushes_ok: counter("flushes_ok_total", "Successful batch flushes")?,
            flushes_failed: counter("flushes_failed_total", "Failed batch flushes")?,
            entries_requeued: counter("entries_requeued_total", "Batch entries re-queued after a failed flush")?,
            entries_dropped: counter("entries_dropped_total", "Batch entries discarded after a failed flush")?,
            breaker_rejections: counter("breaker_rejections_total", "Storage calls rejected by the open circuit")?,
            breaker_state: gauge("breaker_state", "Circuit state (0 closed, 1 open, 2 half-open)")?,
            level_ups: counter("level_ups_total", "Level transitions notified")?,
            punishments: counter("punishments_total", "Restrictions applied")?,
            invites_rewarded: counter("invites_rewarded_total", "Invites that earned a reward")?,
            invites_rejected: counter("invites_rejected_total", "Joins without an eligible inviter")?,
            invites_abandoned: counter("invites_abandoned_total", "Deferred joins given up after storage failures")?,
            deferred_joins: gauge("deferred_joins", "Joins waiting for storage to recover")?,
            queue_depth: gauge("batch_queue_depth", "Users with pending XP")?,
            cache_entries: gauge("cache_entries", "Users in the state cache")?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_counters() {
        let metrics = EngineMetrics::new("discord").unwrap();
        metrics.duplicates.inc();
        metrics.rejected.with_label_values(&["per_minute"]).inc();

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("rally_events_duplicate_total{platform=\"discord\"} 1"));
        assert!(text.contains("rally_messages_rejected_total{platform=\"discord\",reason=\"per_minute\"} 1"));
    }

    #[test]
    fn test_shared_registry_per_platform() {
        let registry = Registry::new();
        assert!(EngineMetrics::with_registry(registry.clone(), "discord").is_ok());
        assert!(EngineMetrics::with_registry(registry.clone(), "telegram").is_ok());
        assert!(EngineMetrics::with_registry(registry, "telegram").is_err());
    }
}
