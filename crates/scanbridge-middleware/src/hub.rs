//! [`BroadcastHub`] – best-effort fan-out of envelopes to every subscriber.
//!
//! `publish` runs synchronously in the caller's task. Each subscriber gets a
//! single non-blocking `try_send`; a subscriber whose buffer is full or whose
//! transport has gone away is removed from the registry and delivery to the
//! others carries on. Nothing is retained, so a subscriber only ever sees
//! envelopes published while it was registered.

use std::sync::Arc;

use scanbridge_types::{Envelope, LinkSink, LinkStatus};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::registry::{Outbound, SubscriberRegistry};

/// Fan-out point between a publisher (the link supervisor) and the
/// [`SubscriberRegistry`].
#[derive(Clone)]
pub struct BroadcastHub {
    registry: Arc<SubscriberRegistry>,
}

impl BroadcastHub {
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Deliver `envelope` to every registered subscriber.
    ///
    /// Returns the number of subscribers the frame was queued for.
    pub fn publish(&self, envelope: &Envelope) -> usize {
        let text = match envelope.to_wire_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "cannot render envelope; not broadcast");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for slot in self.registry.snapshot() {
            match slot.sender.try_send(Outbound::Text(text.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(subscriber_id = %slot.id, "send buffer full; dropping subscriber");
                    failed.push(slot.id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber_id = %slot.id, "transport gone; dropping subscriber");
                    failed.push(slot.id);
                }
            }
        }

        for id in failed {
            self.registry.remove(id);
        }
        debug!(kind = ?envelope.kind, delivered, "envelope broadcast");
        delivered
    }
}

impl LinkSink for BroadcastHub {
    fn on_status(&self, status: LinkStatus) {
        self.publish(&Envelope::status(status));
    }

    /// Empty records are valid at the framing layer but carry no scan, so
    /// the hub discards them here.
    fn on_record(&self, record: String) {
        if record.trim().is_empty() {
            debug!("discarding empty scan record");
            return;
        }
        self.publish(&Envelope::data(record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const CONNECTED: &str = r#"{"type":"status","status":"connected"}"#;
    const ERROR: &str = r#"{"type":"status","status":"error"}"#;

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            match frame {
                Outbound::Text(text) => out.push(text),
                Outbound::Ping => out.push("<ping>".to_string()),
            }
        }
        out
    }

    fn hub() -> (Arc<SubscriberRegistry>, BroadcastHub) {
        let registry = Arc::new(SubscriberRegistry::new(16));
        let hub = BroadcastHub::new(Arc::clone(&registry));
        (registry, hub)
    }

    #[test]
    fn late_subscriber_sees_only_later_records_and_empty_records_are_dropped() {
        let (registry, hub) = hub();
        let (_s1, mut rx1) = registry.connect();

        hub.on_record("A1".to_string());
        let (_s2, mut rx2) = registry.connect();
        hub.on_record(String::new());
        hub.on_record("B2".to_string());

        assert_eq!(drain(&mut rx1), vec![CONNECTED, "A1", "B2"]);
        assert_eq!(drain(&mut rx2), vec![CONNECTED, "B2"]);
    }

    #[test]
    fn every_subscriber_gets_publishes_in_order_without_duplicates() {
        let (registry, hub) = hub();
        let (_a, mut rx_a) = registry.connect();
        let (_b, mut rx_b) = registry.connect();

        let published: Vec<String> = (0..10).map(|i| format!("SCAN-{i}")).collect();
        for p in &published {
            assert_eq!(hub.publish(&Envelope::data(p.clone())), 2);
        }

        let mut expected = vec![CONNECTED.to_string()];
        expected.extend(published);
        assert_eq!(drain(&mut rx_a), expected);
        assert_eq!(drain(&mut rx_b), expected);
    }

    #[test]
    fn failed_send_removes_subscriber_without_aborting_delivery() {
        let (registry, hub) = hub();
        let (gone, rx_gone) = registry.connect();
        let (_live, mut rx_live) = registry.connect();
        let gone_id = gone.id();
        drop(rx_gone);

        assert_eq!(hub.publish(&Envelope::data("A1")), 1);
        assert!(!registry.contains(gone_id));
        assert_eq!(registry.len(), 1);

        assert_eq!(hub.publish(&Envelope::data("B2")), 1);
        assert_eq!(drain(&mut rx_live), vec![CONNECTED, "A1", "B2"]);
    }

    #[test]
    fn full_buffer_evicts_slow_subscriber() {
        let registry = Arc::new(SubscriberRegistry::new(2));
        let hub = BroadcastHub::new(Arc::clone(&registry));
        let (slow, _rx_slow) = registry.connect(); // buffer holds "connected" already

        assert_eq!(hub.publish(&Envelope::data("A1")), 1);
        assert_eq!(hub.publish(&Envelope::data("B2")), 0);
        assert!(!slow.is_registered());
    }

    #[test]
    fn link_status_changes_are_broadcast_as_status_frames() {
        let (registry, hub) = hub();
        let (_s, mut rx) = registry.connect();

        hub.on_status(LinkStatus::Error);
        hub.on_status(LinkStatus::Connected);
        assert_eq!(drain(&mut rx), vec![CONNECTED, ERROR, CONNECTED]);
    }

    #[test]
    fn publish_with_no_subscribers_is_not_an_error() {
        let (_registry, hub) = hub();
        assert_eq!(hub.publish(&Envelope::data("A1")), 0);
    }
}
