//! Inbound routing: frame → channel → bound callbacks.

use crate::channel::Channel;
use crate::protocol::{self, event};

/// Decode `text` and hand it to the channel `lookup` resolves for its topic.
///
/// Malformed frames, heartbeat replies and frames for unknown topics are
/// dropped. Returns the number of callbacks invoked.
pub(crate) fn route(text: &str, lookup: impl FnOnce(&str) -> Option<Channel>) -> usize {
    let frame = match protocol::decode_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("Dropping malformed frame: {e}");
            return 0;
        }
    };

    if frame.event == event::HEARTBEAT_REPLY {
        tracing::trace!(reference = ?frame.reference, "Heartbeat reply");
        return 0;
    }

    let Some(channel) = lookup(&frame.topic) else {
        tracing::trace!(topic = %frame.topic, event = %frame.event, "Dropping frame for unknown topic");
        return 0;
    };

    let invoked = channel.handle_event(&frame.event, &frame.payload);
    if invoked == 0 {
        tracing::trace!(topic = %frame.topic, event = %frame.event, "No bindings matched");
    }
    invoked
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex, Weak};

    use serde_json::Value;

    use super::*;
    use crate::protocol::{ANY_TABLE, ChangeEvent};
    use crate::types::ChannelOptions;

    fn channel(topic: &str) -> Channel {
        Channel::new(topic, ChannelOptions::default(), Weak::new())
    }

    fn lookup_in(channels: &[Channel]) -> impl FnOnce(&str) -> Option<Channel> + '_ {
        move |topic: &str| channels.iter().find(|c| c.topic() == topic).cloned()
    }

    #[test]
    fn fan_out_passes_identical_payload() {
        let ch = channel("T");
        let seen: Arc<Mutex<Vec<(&'static str, usize, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        ch.on(ChangeEvent::Insert, "orders", move |p| {
            s.lock()
                .unwrap()
                .push(("orders", p as *const Value as usize, p.clone()));
        });
        let s = Arc::clone(&seen);
        ch.on(ChangeEvent::Insert, ANY_TABLE, move |p| {
            s.lock()
                .unwrap()
                .push(("any", p as *const Value as usize, p.clone()));
        });

        let channels = [ch];
        let invoked = route(
            r#"{"topic":"T","event":"INSERT","payload":{"table":"orders","id":7}}"#,
            lookup_in(&channels),
        );
        assert_eq!(invoked, 2);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "orders");
        assert_eq!(seen[1].0, "any");
        assert_eq!(seen[0].1, seen[1].1);
        assert_eq!(seen[0].2["id"], 7);
    }

    #[test]
    fn unknown_topic_is_dropped() {
        let ch = channel("T");
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        ch.on_broadcast("typing", move |_| *h.lock().unwrap() += 1);
        let channels = [ch];
        let invoked = route(
            r#"{"topic":"other","event":"typing","payload":{}}"#,
            lookup_in(&channels),
        );
        assert_eq!(invoked, 0);
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn malformed_frame_is_dropped() {
        let mut looked_up = false;
        let invoked = route("{not json", |_| {
            looked_up = true;
            None
        });
        assert_eq!(invoked, 0);
        assert!(!looked_up);
    }

    #[test]
    fn heartbeat_reply_is_consumed() {
        let ch = channel("phoenix");
        ch.on_broadcast("heartbeat_reply", |_| panic!("heartbeat reply must not dispatch"));
        let channels = [ch];
        let invoked = route(
            r#"{"topic":"phoenix","event":"heartbeat_reply","payload":{},"ref":"1"}"#,
            lookup_in(&channels),
        );
        assert_eq!(invoked, 0);
    }

    #[test]
    fn broadcast_envelope_routes_by_inner_event() {
        let ch = channel("room");
        let got = Arc::new(Mutex::new(None));
        let g = Arc::clone(&got);
        ch.on_broadcast("typing", move |p| *g.lock().unwrap() = Some(p.clone()));
        let channels = [ch];
        let invoked = route(
            r#"{"topic":"room","event":"broadcast","payload":{"event":"typing","payload":{"user":"a"}}}"#,
            lookup_in(&channels),
        );
        assert_eq!(invoked, 1);
        let payload = got.lock().unwrap().clone().unwrap();
        assert_eq!(payload["payload"]["user"], "a");
    }

    #[test]
    fn envelopes_do_not_cross_categories() {
        let ch = channel("room");
        let presence_hits = Arc::new(Mutex::new(0));
        let broadcast_hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&presence_hits);
        ch.on_presence(crate::protocol::PresencePhase::Leave, move |_| {
            *h.lock().unwrap() += 1
        });
        let h = Arc::clone(&broadcast_hits);
        ch.on_broadcast("join", move |_| *h.lock().unwrap() += 1);
        let channels = [ch];

        let invoked = route(
            r#"{"topic":"room","event":"broadcast","payload":{"event":"leave"}}"#,
            lookup_in(&channels),
        );
        assert_eq!(invoked, 0);
        let invoked = route(
            r#"{"topic":"room","event":"presence","payload":{"event":"join","key":"u1"}}"#,
            lookup_in(&channels),
        );
        assert_eq!(invoked, 0);
        assert_eq!(*presence_hits.lock().unwrap(), 0);
        assert_eq!(*broadcast_hits.lock().unwrap(), 0);
    }

    #[test]
    fn presence_envelope_routes_by_phase() {
        let ch = channel("room");
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        ch.on_presence(crate::protocol::PresencePhase::Sync, move |_| {
            *h.lock().unwrap() += 1
        });
        let channels = [ch];
        route(
            r#"{"topic":"room","event":"presence","payload":{"event":"sync","state":{}}}"#,
            lookup_in(&channels),
        );
        assert_eq!(*hits.lock().unwrap(), 1);
    }
}
