//! Table of remote peers and their data links
//!
//! One entry per remote peer id, never more.  The entry walks `negotiating -> open -> closed`
//! and is removed as soon as it closes, so a closed peer can always be connected again.
//!
//! Negotiation rules:
//! - an offer from a peer always wins: whatever we had with them is torn down first
//! - answers and candidates only count for a negotiation in progress with that peer
//! - candidates that arrive before the remote description are held until it shows up
//!
//! Nothing in here returns signaling errors to the caller.  Bad or stale messages are
//! logged and dropped.
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::{collections::BTreeMap, fmt, mem};

use super::{DataLink, LinkEvent, LinkState, LinkTransport};
use crate::{
    common::role::Role,
    signal::signal_message::{SignalMessage, SignalType},
};

/// how long a link may stay quiet (or keep negotiating) before we give up on it
pub const DEFAULT_PEER_TIMEOUT_MS: f64 = 10_000.0;

pub struct Peer {
    pub peer_id: String,
    pub role: Role,
    pub state: LinkState,
    /// we sent the offer
    pub initiator: bool,
    /// local msec of the last thing heard from the peer
    pub last_seen: f64,
    pub created: f64,
    link: Box<dyn DataLink>,
    pending_candidates: Vec<Value>,
}

impl Peer {
    fn new(peer_id: &str, role: Role, initiator: bool, now: f64, link: Box<dyn DataLink>) -> Peer {
        Peer {
            peer_id: peer_id.to_string(),
            role,
            state: LinkState::Negotiating,
            initiator,
            last_seen: now,
            created: now,
            link,
            pending_candidates: vec![],
        }
    }
    pub fn link_id(&self) -> u64 {
        self.link.link_id()
    }
    pub fn age(&self, now: f64) -> f64 {
        now - self.last_seen
    }
    // give the link every candidate we were holding for it
    fn flush_candidates(&mut self) {
        for candidate in self.pending_candidates.drain(..) {
            if let Err(e) = self.link.add_remote_candidate(&candidate) {
                debug!("peer_manager::flush_candidates - {}: {}", self.peer_id, e);
            }
        }
    }
    fn add_candidate(&mut self, candidate: &Value) {
        if self.link.has_remote_description() {
            if let Err(e) = self.link.add_remote_candidate(candidate) {
                debug!("peer_manager::add_candidate - {}: {}", self.peer_id, e);
            }
        } else {
            self.pending_candidates.push(candidate.clone());
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ id: {}, role: {}, state: {}, initiator: {}, link: {} }}",
            self.peer_id,
            self.role,
            self.state,
            self.initiator,
            self.link.link_id()
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    StateChanged { peer_id: String, state: LinkState },
    Data { peer_id: String, payload: Vec<u8> },
}

pub struct PeerLinkManager {
    local_id: String,
    master_id: Option<String>,
    transport: Box<dyn LinkTransport>,
    peers: BTreeMap<String, Peer>,
    peer_timeout_ms: f64,
    // state changes made outside of poll, reported on the next one
    events: Vec<PeerEvent>,
    // candidates waiting to go out over signaling
    outgoing: Vec<SignalMessage>,
}

impl PeerLinkManager {
    /// `master_id` is the session master (our own id when we are the master).
    /// `peer_timeout_ms` of zero turns the timeouts off.
    pub fn new(
        local_id: &str,
        master_id: Option<String>,
        transport: Box<dyn LinkTransport>,
        peer_timeout_ms: f64,
    ) -> PeerLinkManager {
        info!(
            "peer_manager::new - {} using {} links, master: {:?}",
            local_id,
            transport.name(),
            master_id
        );
        PeerLinkManager {
            local_id: local_id.to_string(),
            master_id,
            transport,
            peers: BTreeMap::new(),
            peer_timeout_ms,
            events: vec![],
            outgoing: vec![],
        }
    }
    pub fn local_id(&self) -> &str {
        &self.local_id
    }
    pub fn master_id(&self) -> Option<&str> {
        self.master_id.as_deref()
    }
    pub fn set_master_id(&mut self, master_id: Option<String>) {
        self.master_id = master_id;
    }
    pub fn role_of(&self, peer_id: &str) -> Role {
        if self.master_id.as_deref() == Some(peer_id) {
            Role::Master
        } else {
            Role::Follower
        }
    }
    pub fn peer(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }
    /// state of the link to `peer_id`, `None` once it is gone
    pub fn state_of(&self, peer_id: &str) -> Option<LinkState> {
        self.peers.get(peer_id).map(|p| p.state)
    }
    pub fn open_peers(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.state == LinkState::Open)
            .map(|p| p.peer_id.clone())
            .collect()
    }

    /// start negotiating a link to `peer_id`.  Returns the offer to signal, or `None`
    /// when a link already exists or could not be made.
    pub fn connect(&mut self, peer_id: &str, now: f64) -> Option<SignalMessage> {
        if peer_id == self.local_id {
            warn!("peer_manager::connect - not connecting to myself");
            return None;
        }
        if let Some(peer) = self.peers.get(peer_id) {
            debug!("peer_manager::connect - already have {}", peer);
            return None;
        }
        match self.transport.create_offer(peer_id) {
            Ok((link, offer)) => {
                let peer = Peer::new(peer_id, self.role_of(peer_id), true, now, link);
                info!("peer_manager::connect - offering to {}", peer);
                self.peers.insert(peer_id.to_string(), peer);
                self.push_state(peer_id, LinkState::Negotiating);
                Some(SignalMessage::new(SignalType::Offer, &self.local_id, peer_id, offer))
            }
            Err(e) => {
                warn!("peer_manager::connect - cannot make a link to {}: {}", peer_id, e);
                None
            }
        }
    }

    /// close and forget the link to `peer_id`.  Fine to call for unknown peers.
    pub fn disconnect(&mut self, peer_id: &str) -> bool {
        self.teardown(peer_id, "disconnect")
    }

    /// close everything
    pub fn disconnect_all(&mut self) {
        let ids: Vec<String> = self.peers.keys().cloned().collect();
        for id in ids {
            self.teardown(&id, "shutdown");
        }
    }

    /// apply a negotiation message from `from`.  Returns the answer payload when the
    /// message was an offer we accepted.
    pub fn handle_signal(
        &mut self,
        from: &str,
        kind: SignalType,
        payload: &Value,
        now: f64,
    ) -> Option<Value> {
        match kind {
            SignalType::Offer => self.accept_offer(from, payload, now),
            SignalType::Answer => {
                match self.peers.get_mut(from) {
                    Some(peer)
                        if peer.initiator
                            && peer.state == LinkState::Negotiating
                            && !peer.link.has_remote_description() =>
                    {
                        match peer.link.set_remote_description(payload) {
                            Ok(()) => {
                                debug!("peer_manager::handle_signal - answer from {}", from);
                                peer.flush_candidates();
                            }
                            Err(e) => warn!("peer_manager::handle_signal - bad answer from {}: {}", from, e),
                        }
                    }
                    _ => debug!("peer_manager::handle_signal - stray answer from {} ignored", from),
                }
                None
            }
            SignalType::Candidate => {
                match self.peers.get_mut(from) {
                    Some(peer) => peer.add_candidate(payload),
                    None => debug!("peer_manager::handle_signal - candidate from unknown {}", from),
                }
                None
            }
            SignalType::Hello | SignalType::Bye => None,
        }
    }

    fn accept_offer(&mut self, from: &str, offer: &Value, now: f64) -> Option<Value> {
        if self.peers.contains_key(from) {
            // they are starting over, so do we
            info!("peer_manager::accept_offer - renegotiating with {}", from);
            self.teardown(from, "renegotiation");
        }
        match self.transport.accept_offer(from, offer) {
            Ok((link, answer)) => {
                let peer = Peer::new(from, self.role_of(from), false, now, link);
                info!("peer_manager::accept_offer - answering {}", peer);
                self.peers.insert(from.to_string(), peer);
                self.push_state(from, LinkState::Negotiating);
                Some(answer)
            }
            Err(e) => {
                warn!("peer_manager::accept_offer - bad offer from {}: {}", from, e);
                None
            }
        }
    }

    /// best effort send to one peer.  Dropped unless the link is open.
    pub fn send_to(&mut self, peer_id: &str, payload: &[u8]) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) if peer.state == LinkState::Open => match peer.link.send(payload) {
                Ok(()) => true,
                Err(e) => {
                    debug!("peer_manager::send_to - {}: {}", peer_id, e);
                    false
                }
            },
            _ => false,
        }
    }

    /// send to every open link, except `exclude`.  Returns how many sends worked.
    pub fn broadcast(&mut self, payload: &[u8], exclude: Option<&str>) -> usize {
        let mut sent = 0;
        for peer in self.peers.values_mut() {
            if peer.state != LinkState::Open || exclude == Some(peer.peer_id.as_str()) {
                continue;
            }
            match peer.link.send(payload) {
                Ok(()) => sent += 1,
                Err(e) => debug!("peer_manager::broadcast - {}: {}", peer.peer_id, e),
            }
        }
        sent
    }

    /// drive every link.  Returns state changes and received data in arrival order.
    pub fn poll(&mut self, now: f64) -> Vec<PeerEvent> {
        let mut events = mem::take(&mut self.events);
        let mut dead: Vec<(String, String)> = vec![];
        for peer in self.peers.values_mut() {
            for ev in peer.link.poll(now) {
                match ev {
                    LinkEvent::Open => {
                        if peer.state == LinkState::Negotiating {
                            info!("peer_manager::poll - link to {} is open", peer.peer_id);
                            peer.state = LinkState::Open;
                            peer.last_seen = now;
                            events.push(PeerEvent::StateChanged {
                                peer_id: peer.peer_id.clone(),
                                state: LinkState::Open,
                            });
                        }
                    }
                    LinkEvent::Data(payload) => {
                        if peer.state == LinkState::Open {
                            peer.last_seen = now;
                            events.push(PeerEvent::Data {
                                peer_id: peer.peer_id.clone(),
                                payload,
                            });
                        }
                    }
                    LinkEvent::LocalCandidate(candidate) => {
                        self.outgoing.push(SignalMessage::new(
                            SignalType::Candidate,
                            &self.local_id,
                            &peer.peer_id,
                            candidate,
                        ));
                    }
                    LinkEvent::Closed(reason) => {
                        dead.push((peer.peer_id.clone(), reason));
                    }
                }
            }
            if self.peer_timeout_ms > 0.0 {
                let expired = match peer.state {
                    LinkState::Open => peer.age(now) > self.peer_timeout_ms,
                    LinkState::Negotiating => now - peer.created > self.peer_timeout_ms,
                    LinkState::Closed => false,
                };
                if expired && !dead.iter().any(|(id, _)| *id == peer.peer_id) {
                    dead.push((peer.peer_id.clone(), format!("{} timed out", peer.state)));
                }
            }
        }
        for (peer_id, reason) in dead {
            self.teardown(&peer_id, &reason);
        }
        events.append(&mut self.events);
        events
    }

    /// candidate messages produced since the last call
    pub fn take_outgoing_signals(&mut self) -> Vec<SignalMessage> {
        mem::take(&mut self.outgoing)
    }

    fn teardown(&mut self, peer_id: &str, reason: &str) -> bool {
        match self.peers.remove(peer_id) {
            Some(mut peer) => {
                info!("peer_manager::teardown - {} closed: {}", peer_id, reason);
                peer.state = LinkState::Closed;
                peer.link.close();
                self.push_state(peer_id, LinkState::Closed);
                true
            }
            None => false,
        }
    }
    fn push_state(&mut self, peer_id: &str, state: LinkState) {
        self.events.push(PeerEvent::StateChanged {
            peer_id: peer_id.to_string(),
            state,
        });
    }

    /// json summary of every peer
    pub fn get_status(&self, now: f64) -> Value {
        let peers: Vec<Value> = self
            .peers
            .values()
            .map(|p| {
                json!({
                    "peer_id": p.peer_id,
                    "role": p.role,
                    "state": p.state,
                    "initiator": p.initiator,
                    "idle_ms": p.age(now),
                })
            })
            .collect();
        json!(peers)
    }
}

impl fmt::Display for PeerLinkManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[ ")?;
        for peer in self.peers.values() {
            write!(f, " {},", peer)?;
        }
        write!(f, " ]")
    }
}

#[cfg(test)]
mod test_peer_manager {
    use super::*;
    use crate::link::loopback::LoopbackNetwork;

    fn manager(net: &LoopbackNetwork, id: &str, master: &str) -> PeerLinkManager {
        PeerLinkManager::new(
            id,
            Some(master.to_string()),
            Box::new(net.transport(id)),
            DEFAULT_PEER_TIMEOUT_MS,
        )
    }
    // f (initiator) negotiates with m
    fn open_pair(net: &LoopbackNetwork) -> (PeerLinkManager, PeerLinkManager) {
        let mut m = manager(net, "m", "m");
        let mut f = manager(net, "f", "m");
        let offer = f.connect("m", 0.0).unwrap();
        assert_eq!(offer.kind, SignalType::Offer);
        assert_eq!(offer.target, "m");
        let answer = m.handle_signal("f", SignalType::Offer, &offer.payload, 0.0).unwrap();
        assert!(f.handle_signal("m", SignalType::Answer, &answer, 0.0).is_none());
        f.poll(1.0);
        m.poll(1.0);
        (m, f)
    }

    #[test]
    fn negotiate_to_open() {
        let net = LoopbackNetwork::new();
        let mut m = manager(&net, "m", "m");
        let mut f = manager(&net, "f", "m");
        let offer = f.connect("m", 0.0).unwrap();
        assert_eq!(f.state_of("m"), Some(LinkState::Negotiating));
        assert_eq!(f.peer("m").unwrap().role, Role::Master);
        let answer = m.handle_signal("f", SignalType::Offer, &offer.payload, 0.0).unwrap();
        assert_eq!(m.peer("f").unwrap().role, Role::Follower);
        assert!(!m.peer("f").unwrap().initiator);
        f.handle_signal("m", SignalType::Answer, &answer, 0.0);
        let events = f.poll(1.0);
        assert_eq!(
            events,
            vec![
                PeerEvent::StateChanged {
                    peer_id: "m".to_string(),
                    state: LinkState::Negotiating
                },
                PeerEvent::StateChanged {
                    peer_id: "m".to_string(),
                    state: LinkState::Open
                },
            ]
        );
        m.poll(1.0);
        assert_eq!(m.state_of("f"), Some(LinkState::Open));
        assert_eq!(m.open_peers(), vec!["f".to_string()]);
    }
    #[test]
    fn one_link_per_peer() {
        let net = LoopbackNetwork::new();
        let (_m, mut f) = open_pair(&net);
        assert!(f.connect("m", 2.0).is_none());
        assert!(f.connect("f", 2.0).is_none());
        assert_eq!(net.links_owned_by("f"), 1);
    }
    #[test]
    fn data_only_on_open_links() {
        let net = LoopbackNetwork::new();
        let mut m = manager(&net, "m", "m");
        let mut f = manager(&net, "f", "m");
        let _offer = f.connect("m", 0.0).unwrap();
        assert!(!f.send_to("m", &[1]));
        assert!(!f.send_to("nobody", &[1]));
        assert_eq!(f.broadcast(&[1], None), 0);
        let (mut m2, mut f2) = open_pair(&net);
        assert!(f2.send_to("m", &[9, 9]));
        let events = m2.poll(2.0);
        assert_eq!(
            events,
            vec![PeerEvent::Data {
                peer_id: "f".to_string(),
                payload: vec![9, 9]
            }]
        );
        m.disconnect_all();
        f.disconnect_all();
    }
    #[test]
    fn broadcast_skips_excluded() {
        let net = LoopbackNetwork::new();
        let mut m = manager(&net, "m", "m");
        let mut followers = vec![];
        for id in ["f1", "f2", "f3"] {
            let mut f = manager(&net, id, "m");
            let offer = f.connect("m", 0.0).unwrap();
            let answer = m.handle_signal(id, SignalType::Offer, &offer.payload, 0.0).unwrap();
            f.handle_signal("m", SignalType::Answer, &answer, 0.0);
            f.poll(1.0);
            followers.push(f);
        }
        m.poll(1.0);
        assert_eq!(m.broadcast(&[7], Some("f1")), 2);
        let got: Vec<usize> = followers
            .iter_mut()
            .map(|f| {
                f.poll(2.0)
                    .iter()
                    .filter(|e| matches!(e, PeerEvent::Data { .. }))
                    .count()
            })
            .collect();
        assert_eq!(got, vec![0, 1, 1]);
    }
    #[test]
    fn new_offer_resets_existing_link() {
        let net = LoopbackNetwork::new();
        let (mut m, mut f) = open_pair(&net);
        let old_link = m.peer("f").unwrap().link_id();
        assert_eq!(net.live_links(), 2);
        // f restarts and offers again
        f.disconnect("m");
        let offer = f.connect("m", 5.0).unwrap();
        let answer = m.handle_signal("f", SignalType::Offer, &offer.payload, 5.0).unwrap();
        let events = m.poll(5.0);
        assert_eq!(
            events,
            vec![
                PeerEvent::StateChanged {
                    peer_id: "f".to_string(),
                    state: LinkState::Closed
                },
                PeerEvent::StateChanged {
                    peer_id: "f".to_string(),
                    state: LinkState::Negotiating
                },
            ]
        );
        assert_ne!(m.peer("f").unwrap().link_id(), old_link);
        f.handle_signal("m", SignalType::Answer, &answer, 5.0);
        f.poll(6.0);
        m.poll(6.0);
        assert_eq!(m.state_of("f"), Some(LinkState::Open));
        // the old pair is gone, only the new one is left
        assert_eq!(net.live_links(), 2);
    }
    #[test]
    fn offer_while_negotiating_starts_over() {
        let net = LoopbackNetwork::new();
        let mut m = manager(&net, "m", "m");
        let mut first = manager(&net, "f", "m");
        let offer = first.connect("m", 0.0).unwrap();
        let _lost_answer = m.handle_signal("f", SignalType::Offer, &offer.payload, 0.0).unwrap();
        assert_eq!(m.state_of("f"), Some(LinkState::Negotiating));
        let old_link = m.peer("f").unwrap().link_id();

        // the answer never made it, f starts again from scratch
        let mut second = manager(&net, "f", "m");
        let offer = second.connect("m", 1.0).unwrap();
        let answer = m.handle_signal("f", SignalType::Offer, &offer.payload, 1.0).unwrap();
        assert_ne!(m.peer("f").unwrap().link_id(), old_link);
        assert_eq!(m.state_of("f"), Some(LinkState::Negotiating));
        assert_eq!(net.links_owned_by("m"), 1);
        let states: Vec<LinkState> = m
            .poll(1.0)
            .into_iter()
            .filter_map(|e| match e {
                PeerEvent::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![LinkState::Negotiating, LinkState::Closed, LinkState::Negotiating]
        );

        second.handle_signal("m", SignalType::Answer, &answer, 2.0);
        second.poll(2.0);
        m.poll(2.0);
        assert_eq!(m.state_of("f"), Some(LinkState::Open));
        assert_eq!(second.state_of("m"), Some(LinkState::Open));
        assert_eq!(net.links_owned_by("m"), 1);
        // the stale offer never opens
        assert_eq!(first.state_of("m"), Some(LinkState::Negotiating));
    }
    #[test]
    fn early_candidates_wait_for_the_answer() {
        use crate::link::udp_link::UdpTransport;
        use std::{net::IpAddr, thread::sleep, time::Duration};

        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let udp_manager = |id: &str| {
            PeerLinkManager::new(id, Some("m".to_string()), Box::new(UdpTransport::new(ip, ip)), 0.0)
        };
        let mut m = udp_manager("m");
        let mut f = udp_manager("f");
        let offer = f.connect("m", 0.0).unwrap();
        let answer = m.handle_signal("f", SignalType::Offer, &offer.payload, 0.0).unwrap();

        // m's candidate reaches f ahead of the answer
        m.poll(0.0);
        let candidates = m.take_outgoing_signals();
        assert_eq!(candidates.len(), 1);
        for c in &candidates {
            assert_eq!(c.kind, SignalType::Candidate);
            assert_eq!(c.target, "f");
            assert!(f.handle_signal("m", SignalType::Candidate, &c.payload, 0.0).is_none());
        }
        assert_eq!(f.peer("m").unwrap().pending_candidates.len(), 1);
        f.handle_signal("m", SignalType::Answer, &answer, 0.0);
        assert!(f.peer("m").unwrap().pending_candidates.is_empty());

        // m already has the offer, so f's candidate is used right away
        f.poll(0.0);
        for c in f.take_outgoing_signals() {
            m.handle_signal("f", SignalType::Candidate, &c.payload, 0.0);
        }
        assert!(m.peer("f").unwrap().pending_candidates.is_empty());

        let mut now = 0.0;
        for _ in 0..200 {
            f.poll(now);
            m.poll(now);
            if f.state_of("m") == Some(LinkState::Open) && m.state_of("f") == Some(LinkState::Open) {
                break;
            }
            now += 300.0;
            sleep(Duration::from_millis(2));
        }
        assert_eq!(f.state_of("m"), Some(LinkState::Open));
        assert_eq!(m.state_of("f"), Some(LinkState::Open));
        assert!(f.send_to("m", &[1, 2, 3]));
    }
    #[test]
    fn stray_answers_and_candidates_ignored() {
        let net = LoopbackNetwork::new();
        let (mut m, _f) = open_pair(&net);
        // m never offered to f, and nobody knows "x"
        assert!(m.handle_signal("f", SignalType::Answer, &json!({"transport": "loopback", "endpoint": 1}), 3.0).is_none());
        assert!(m.handle_signal("x", SignalType::Answer, &json!({}), 3.0).is_none());
        assert!(m.handle_signal("x", SignalType::Candidate, &json!({}), 3.0).is_none());
        assert_eq!(m.state_of("f"), Some(LinkState::Open));
        assert_eq!(m.state_of("x"), None);
    }
    #[test]
    fn bad_offer_makes_no_peer() {
        let net = LoopbackNetwork::new();
        let mut m = manager(&net, "m", "m");
        assert!(m.handle_signal("f", SignalType::Offer, &json!({"garbage": true}), 0.0).is_none());
        assert_eq!(m.state_of("f"), None);
    }
    #[test]
    fn disconnect_is_idempotent() {
        let net = LoopbackNetwork::new();
        let (mut m, mut f) = open_pair(&net);
        assert!(f.disconnect("m"));
        assert!(!f.disconnect("m"));
        assert_eq!(f.state_of("m"), None);
        // far end notices
        let events = m.poll(3.0);
        assert!(events.contains(&PeerEvent::StateChanged {
            peer_id: "f".to_string(),
            state: LinkState::Closed
        }));
        assert_eq!(m.state_of("f"), None);
        assert_eq!(net.live_links(), 0);
    }
    #[test]
    fn quiet_links_time_out() {
        let net = LoopbackNetwork::new();
        let (mut m, _f) = open_pair(&net);
        assert!(m.poll(DEFAULT_PEER_TIMEOUT_MS).is_empty());
        let events = m.poll(DEFAULT_PEER_TIMEOUT_MS + 2.0);
        assert_eq!(
            events,
            vec![PeerEvent::StateChanged {
                peer_id: "f".to_string(),
                state: LinkState::Closed
            }]
        );
    }
    #[test]
    fn stalled_negotiation_times_out() {
        let net = LoopbackNetwork::new();
        let mut f = manager(&net, "f", "m");
        let _offer = f.connect("m", 0.0).unwrap();
        f.poll(1.0);
        f.poll(DEFAULT_PEER_TIMEOUT_MS + 1.0);
        assert_eq!(f.state_of("m"), None);
        assert_eq!(net.live_links(), 0);
        println!("manager: {}", f);
    }
}
