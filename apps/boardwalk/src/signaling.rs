use std::net::SocketAddr;
use std::sync::Arc;

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::config::SignalingConfig;
use crate::matchmaker::{Delivery, Matchmaker, RelayRoute};
use crate::protocol::{ClientMessage, ConnectionId, Identity, ServerMessage};
use crate::registry::{now_millis, ConnectionRegistry, Outbound};

/// Shared state for every signaling connection: the transport registry and
/// the matchmaker. Cloned into each connection handler.
#[derive(Clone)]
pub struct SignalingState {
    registry: ConnectionRegistry,
    matchmaker: Arc<Matchmaker>,
    config: Arc<SignalingConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalingStats {
    pub connections: usize,
    pub waiting: usize,
    pub partnerships: usize,
    pub waiting_ids: Vec<ConnectionId>,
}

impl SignalingState {
    pub fn new(config: SignalingConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            matchmaker: Arc::new(Matchmaker::new(config.matched_event)),
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn matchmaker(&self) -> &Matchmaker {
        &self.matchmaker
    }

    pub fn connect(
        &self,
        remote_addr: Option<SocketAddr>,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let (connection_id, receiver) = self.registry.register(remote_addr);
        self.matchmaker.on_connect(connection_id);
        counter!("boardwalk_connections_total", 1);
        gauge!("boardwalk_connections_active", self.registry.len() as f64);
        (connection_id, receiver)
    }

    /// Handles one inbound text frame. Malformed frames are logged and
    /// dropped; the connection keeps its current state.
    pub fn handle_frame(&self, connection_id: ConnectionId, text: &str) {
        if !self.registry.contains(connection_id) {
            debug!(connection_id = %connection_id, "dropping frame from closed connection");
            return;
        }
        self.registry.touch(connection_id);
        match ClientMessage::decode(text) {
            Ok(message) => self.handle_message(connection_id, message, text),
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "ignoring malformed message");
                counter!(
                    "boardwalk_malformed_messages_total",
                    1,
                    "reason" => err.metric_label()
                );
            }
        }
    }

    pub fn handle_message(&self, connection_id: ConnectionId, message: ClientMessage, raw: &str) {
        debug!(connection_id = %connection_id, kind = message.kind(), "client message");
        match message {
            ClientMessage::Search {
                user_id,
                user_profile,
            } => {
                counter!("boardwalk_searches_total", 1);
                let deliveries = self
                    .matchmaker
                    .on_search(connection_id, Identity::new(user_id, user_profile));
                self.deliver(deliveries);
            }
            ClientMessage::StopSearch { .. } => {
                self.matchmaker.on_stop_search(connection_id);
            }
            ClientMessage::SkipToNext { user_id } => {
                counter!("boardwalk_skips_total", 1);
                let deliveries = self
                    .matchmaker
                    .on_skip(connection_id, Identity::anonymous(user_id));
                self.deliver(deliveries);
            }
            ClientMessage::Offer {} | ClientMessage::Answer {} | ClientMessage::Candidate {} => {
                self.relay(connection_id, message.kind(), raw);
            }
            ClientMessage::Ping => {
                self.registry
                    .send(connection_id, Outbound::Event(ServerMessage::Pong));
            }
        }
        self.record_lobby_gauges();
    }

    fn relay(&self, connection_id: ConnectionId, kind: &'static str, raw: &str) {
        match self.matchmaker.route_relay(connection_id) {
            RelayRoute::Forward(partner) => {
                if self.registry.send(partner, Outbound::Relay(raw.to_string())) {
                    counter!("boardwalk_relayed_messages_total", 1, "kind" => kind);
                    histogram!("boardwalk_relayed_message_bytes", raw.len() as f64);
                } else {
                    debug!(
                        connection_id = %connection_id,
                        partner_id = %partner,
                        kind,
                        "partner gone; dropping relay"
                    );
                    counter!("boardwalk_relay_dropped_total", 1, "reason" => "partner_gone");
                }
            }
            RelayRoute::NotPaired => {
                debug!(connection_id = %connection_id, kind, "not paired; dropping relay");
                counter!("boardwalk_relay_dropped_total", 1, "reason" => "not_paired");
            }
            RelayRoute::Broken(deliveries) => {
                counter!("boardwalk_invariant_violations_total", 1);
                self.deliver(deliveries);
            }
        }
    }

    /// Tears down everything `connection_id` took part in, then forgets its
    /// transport. Safe to call more than once.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        let deliveries = self.matchmaker.on_disconnect(connection_id);
        let removed = self.registry.unregister(connection_id);
        self.deliver(deliveries);
        if removed {
            gauge!("boardwalk_connections_active", self.registry.len() as f64);
            self.record_lobby_gauges();
        }
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        for Delivery { to, message } in deliveries {
            if let Some(peer) = message.matched_peer() {
                if peer.is_initiator {
                    counter!("boardwalk_matches_total", 1);
                }
            }
            if !self.registry.send(to, Outbound::Event(message)) {
                debug!(connection_id = %to, "recipient gone; dropping event");
            }
        }
    }

    fn record_lobby_gauges(&self) {
        let counts = self.matchmaker.counts();
        gauge!("boardwalk_waiting", counts.waiting as f64);
        gauge!("boardwalk_partnerships", counts.partnerships as f64);
    }

    pub fn stats(&self) -> SignalingStats {
        let snapshot = self.matchmaker.snapshot();
        SignalingStats {
            connections: self.registry.len(),
            waiting: snapshot.waiting.len(),
            partnerships: snapshot.partnerships,
            waiting_ids: snapshot.waiting,
        }
    }

    /// Closes connections idle past the configured timeout, running the
    /// normal disconnect teardown for each. Returns how many were closed.
    pub fn close_idle(&self, now: u64) -> usize {
        let Some(timeout) = self.config.idle_timeout else {
            return 0;
        };
        let idle = self.registry.idle_since(now, timeout);
        for connection_id in &idle {
            info!(connection_id = %connection_id, "closing idle connection");
            self.registry
                .send(*connection_id, Outbound::Close("idle timeout"));
            self.disconnect(*connection_id);
            counter!("boardwalk_idle_closed_total", 1);
        }
        idle.len()
    }

    pub fn spawn_idle_monitor(&self) -> Option<JoinHandle<()>> {
        self.config.idle_timeout?;
        let state = self.clone();
        let mut interval = tokio::time::interval(self.config.idle_check_interval);
        Some(tokio::spawn(async move {
            loop {
                interval.tick().await;
                state.close_idle(now_millis());
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::matchmaker::PeerState;
    use crate::protocol::{MatchedEvent, MatchedPeer};
    use serde_json::json;

    struct Client {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Client {
        fn connect(state: &SignalingState) -> Self {
            let (id, rx) = state.connect(None);
            Self { id, rx }
        }

        fn send(&self, state: &SignalingState, value: serde_json::Value) {
            state.handle_frame(self.id, &value.to_string());
        }

        fn search(&self, state: &SignalingState, user: &str) {
            self.send(
                state,
                json!({"type": "search", "userId": user, "userProfile": {"username": user}}),
            );
        }

        fn drain(&mut self) -> Vec<Outbound> {
            let mut out = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                out.push(message);
            }
            out
        }

        fn matched(&mut self) -> MatchedPeer {
            let frames = self.drain();
            match frames.as_slice() {
                [Outbound::Event(ServerMessage::Matched(peer))] => peer.clone(),
                other => panic!("expected a single matched event, got {other:?}"),
            }
        }
    }

    fn state() -> SignalingState {
        SignalingState::new(SignalingConfig {
            matched_event: MatchedEvent::Matched,
            idle_timeout: Some(Duration::from_secs(30)),
            idle_check_interval: Duration::from_secs(1),
        })
    }

    fn event(message: ServerMessage) -> Outbound {
        Outbound::Event(message)
    }

    #[test_timeout::timeout]
    fn three_clients_pair_skip_and_rematch() {
        let state = state();
        let mut one = Client::connect(&state);
        let mut two = Client::connect(&state);
        let mut three = Client::connect(&state);

        one.search(&state, "one");
        assert_eq!(one.drain(), vec![event(ServerMessage::Searching)]);

        two.search(&state, "two");
        let to_two = two.matched();
        let to_one = one.matched();
        assert!(to_two.is_initiator);
        assert!(!to_one.is_initiator);
        assert_eq!(to_two.peer_id.as_deref(), Some("one"));
        assert_eq!(
            to_one
                .peer_profile
                .as_ref()
                .and_then(|p| p.username.as_deref()),
            Some("two")
        );

        three.search(&state, "three");
        assert_eq!(three.drain(), vec![event(ServerMessage::Searching)]);

        one.send(&state, json!({"type": "skipToNext", "userId": "one"}));
        assert_eq!(two.drain(), vec![event(ServerMessage::SkipToNext)]);
        let to_one = one.matched();
        let to_three = three.matched();
        assert!(to_one.is_initiator);
        assert!(!to_three.is_initiator);
        assert_eq!(to_one.peer_id.as_deref(), Some("three"));
        assert_eq!(
            state.matchmaker().state(two.id),
            PeerState::Idle
        );
        assert!(state.matchmaker().check_invariants().is_ok());
    }

    #[test_timeout::timeout]
    fn relay_forwards_raw_frame_to_partner_only() {
        let state = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        let mut c = Client::connect(&state);
        a.search(&state, "a");
        b.search(&state, "b");
        c.search(&state, "c");
        a.drain();
        b.drain();
        c.drain();

        let raw = r#"{"type":"offer","offer":{"type":"offer","sdp":"v=0\r\no=- 1 2 IN IP4 0.0.0.0"},  "seq": 1}"#;
        state.handle_frame(a.id, raw);

        assert_eq!(b.drain(), vec![Outbound::Relay(raw.to_string())]);
        assert!(a.drain().is_empty());
        assert!(c.drain().is_empty());
    }

    #[test_timeout::timeout]
    fn relay_preserves_order_within_a_connection() {
        let state = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.search(&state, "a");
        b.search(&state, "b");
        a.drain();
        b.drain();

        let frames: Vec<String> = (0..5)
            .map(|seq| json!({"type": "candidate", "candidate": {"seq": seq}}).to_string())
            .collect();
        for frame in &frames {
            state.handle_frame(b.id, frame);
        }

        let received: Vec<Outbound> = frames.iter().cloned().map(Outbound::Relay).collect();
        assert_eq!(a.drain(), received);
    }

    #[test_timeout::timeout]
    fn relay_from_unpaired_connection_is_dropped() {
        let state = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.send(&state, json!({"type": "answer", "answer": {}}));
        b.search(&state, "b");

        assert!(a.drain().is_empty());
        assert_eq!(b.drain(), vec![event(ServerMessage::Searching)]);
    }

    #[test_timeout::timeout]
    fn disconnect_notifies_survivor_exactly_once() {
        let state = state();
        let a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.search(&state, "a");
        b.search(&state, "b");
        b.drain();

        state.disconnect(a.id);
        state.disconnect(a.id);

        assert_eq!(b.drain(), vec![event(ServerMessage::SkipToNext)]);
        assert!(!state.registry().contains(a.id));
        assert_eq!(state.matchmaker().state(a.id), PeerState::Idle);
        let stats = state.stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.partnerships, 0);
    }

    #[test_timeout::timeout]
    fn skip_after_disconnect_does_nothing() {
        let state = state();
        let a = Client::connect(&state);
        let mut b = Client::connect(&state);
        let mut c = Client::connect(&state);
        a.search(&state, "a");
        b.search(&state, "b");
        b.drain();

        state.disconnect(a.id);
        b.drain();
        // a stale skip racing the close must not resurrect `a`
        state.handle_message(
            a.id,
            ClientMessage::SkipToNext { user_id: None },
            r#"{"type":"skipToNext"}"#,
        );

        assert!(b.drain().is_empty());
        assert!(state.stats().waiting_ids.is_empty());
        c.search(&state, "c");
        assert_eq!(c.drain(), vec![event(ServerMessage::Searching)]);
        assert_eq!(state.matchmaker().state(c.id), PeerState::Searching);
    }

    #[test_timeout::timeout]
    fn frames_from_a_closed_connection_are_dropped() {
        let state = state();
        let a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.search(&state, "a");
        b.search(&state, "b");
        b.drain();

        state.close_idle(u64::MAX);
        let mut c = Client::connect(&state);
        a.send(&state, json!({"type": "search", "userId": "a"}));
        a.send(&state, json!({"type": "skipToNext", "userId": "a"}));
        c.search(&state, "c");

        assert_eq!(c.drain(), vec![event(ServerMessage::Searching)]);
        assert_eq!(state.stats().waiting_ids, vec![c.id]);
        assert!(state.matchmaker().check_invariants().is_ok());
    }

    #[test_timeout::timeout]
    fn stop_search_leaves_the_pool_silently() {
        let state = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.search(&state, "a");
        a.drain();

        a.send(&state, json!({"type": "stopSearch", "userId": "a"}));
        b.search(&state, "b");

        assert!(a.drain().is_empty());
        assert_eq!(b.drain(), vec![event(ServerMessage::Searching)]);
    }

    #[test_timeout::timeout]
    fn malformed_frames_do_not_change_state() {
        let state = state();
        let mut a = Client::connect(&state);
        a.search(&state, "a");
        a.drain();

        state.handle_frame(a.id, "{oops");
        state.handle_frame(a.id, r#"{"userId":"a"}"#);
        state.handle_frame(a.id, r#"{"type":"dance"}"#);

        assert!(a.drain().is_empty());
        assert_eq!(state.matchmaker().state(a.id), PeerState::Searching);
    }

    #[test_timeout::timeout]
    fn ping_is_answered_with_pong() {
        let state = state();
        let mut a = Client::connect(&state);
        a.send(&state, json!({"type": "ping"}));
        assert_eq!(a.drain(), vec![event(ServerMessage::Pong)]);
    }

    #[test_timeout::timeout]
    fn idle_connections_are_closed_and_torn_down() {
        let state = state();
        let mut a = Client::connect(&state);
        let mut b = Client::connect(&state);
        a.search(&state, "a");
        b.search(&state, "b");
        a.drain();
        b.drain();

        let registered = state.registry().info(a.id).unwrap().last_activity;
        assert_eq!(state.close_idle(registered + 1_000), 0);

        let closed = state.close_idle(registered + 31_000);
        assert_eq!(closed, 2);
        assert!(a.drain().contains(&Outbound::Close("idle timeout")));
        assert!(b.drain().contains(&Outbound::Close("idle timeout")));
        assert_eq!(state.stats().connections, 0);
        assert_eq!(state.stats().partnerships, 0);
    }

    #[test_timeout::timeout]
    fn idle_monitor_is_disabled_without_timeout() {
        let state = SignalingState::new(SignalingConfig {
            idle_timeout: None,
            ..SignalingConfig::default()
        });
        let (_id, _rx) = state.connect(None);
        assert_eq!(state.close_idle(u64::MAX), 0);
        assert!(state.spawn_idle_monitor().is_none());
    }
}
