//! the JamSession ties signaling, links, clock sync, routing and playback together
//!
//! The session drives off [`JamSession::process`], called every millisecond or so from
//! one thread.  Nothing inside blocks.  Each tick it:
//! - drains the signaling channel (presence and link negotiation)
//! - hands new link candidates to signaling
//! - polls the links (state changes, midi frames, sync messages)
//! - sends a sync ping when one is due (followers)
//! - presents every scheduled event whose time has come
//!
//! Results go out on the `mpsc::Sender<SessionEvent>` given to [`JamSession::new`].
//! UI commands come in through the public methods or as [`ParamMessage`]s.
//!
//! # Example
//! ```
//! use std::sync::{mpsc, Arc};
//! use rtjam_midi::clock::ManualClock;
//! use rtjam_midi::common::role::Role;
//! use rtjam_midi::link::loopback::LoopbackNetwork;
//! use rtjam_midi::session::jam_session::{JamSession, SessionSettings};
//! use rtjam_midi::signal::local_hub::LocalSignalHub;
//!
//! let hub = LocalSignalHub::new();
//! let net = LoopbackNetwork::new();
//! let clock = ManualClock::new(1000.0);
//! let (event_tx, _event_rx) = mpsc::channel();
//! let mut session = JamSession::new(
//!     SessionSettings::new("m", Role::Master, None),
//!     Arc::new(clock.clone()),
//!     Box::new(hub.join("m").unwrap()),
//!     Box::new(net.transport("m")),
//!     event_tx,
//! );
//! session.process();
//! ```
use log::{debug, info, trace, warn};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{mpsc, Arc},
};

use super::{
    param_message::{ParamMessage, SessionParam},
    routing::{FilterMode, RoutingPolicy},
};
use crate::{
    clock::{
        clock_sync::{ClockSyncEngine, SyncConfig, SyncOutcome, SyncStats},
        sync_message::SyncMessage,
        Clock,
    },
    common::{
        box_error::BoxError,
        midi_packet::{FrameEncoder, MidiFrame, SequenceStatus, SequenceTracker, FRAME_SIZE},
        role::Role,
        stream_time_stat::IntervalTimer,
    },
    link::{
        peer_manager::{PeerEvent, PeerLinkManager, DEFAULT_PEER_TIMEOUT_MS},
        LinkState, LinkTransport,
    },
    playback::scheduler::{PlaybackScheduler, SchedulerConfig},
    signal::{
        signal_message::{SignalMessage, SignalType},
        SignalEvent, SignalingChannel,
    },
};

/// how often a status snapshot goes out
pub const STATUS_INTERVAL_MS: f64 = 2000.0;
/// wait before a follower tries the master again after losing the link
pub const RECONNECT_WAIT_MS: f64 = 2000.0;

/// what the session tells the outside world
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// a remote event reached its presentation time
    EventReceived { peer_id: String, frame: MidiFrame },
    LinkStateChanged { peer_id: String, state: LinkState },
    SyncStatsUpdated(SyncStats),
    Status(Value),
}

impl SessionEvent {
    pub fn as_json(&self) -> Value {
        match self {
            SessionEvent::EventReceived { peer_id, frame } => json!({
                "type": "event",
                "peerId": peer_id,
                "sequence": frame.sequence_id,
                "timestamp": frame.origin_timestamp_ms,
                "status": frame.status,
                "data1": frame.data1,
                "data2": frame.data2,
                "midi": frame.describe(),
            }),
            SessionEvent::LinkStateChanged { peer_id, state } => json!({
                "type": "linkState",
                "peerId": peer_id,
                "state": state,
            }),
            SessionEvent::SyncStatsUpdated(stats) => json!({
                "type": "syncStats",
                "rttMs": stats.rtt_ms,
                "offsetMs": stats.offset_ms,
                "jitterMs": stats.jitter_ms,
            }),
            SessionEvent::Status(status) => json!({
                "type": "status",
                "status": status,
            }),
        }
    }
}

/// everything needed to build a session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub local_id: String,
    pub role: Role,
    /// the master's endpoint id.  Ignored on the master itself.
    pub master_id: Option<String>,
    pub scheduler: SchedulerConfig,
    pub sync: SyncConfig,
    pub filter_mode: FilterMode,
    pub relay_enabled: bool,
    pub peer_timeout_ms: f64,
}

impl SessionSettings {
    pub fn new(local_id: &str, role: Role, master_id: Option<&str>) -> SessionSettings {
        SessionSettings {
            local_id: local_id.to_string(),
            role,
            master_id: master_id.map(String::from),
            scheduler: SchedulerConfig::default(),
            sync: SyncConfig::default(),
            filter_mode: FilterMode::Solo,
            relay_enabled: false,
            peer_timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
        }
    }
}

pub struct JamSession {
    local_id: String,
    role: Role,
    master_id: Option<String>,
    signaling: Box<dyn SignalingChannel>,
    links: PeerLinkManager,
    sync: ClockSyncEngine,
    scheduler: PlaybackScheduler,
    encoder: FrameEncoder,
    routing: Arc<RoutingPolicy>,
    trackers: HashMap<String, SequenceTracker>,
    observer: mpsc::Sender<SessionEvent>,
    status_timer: IntervalTimer,
    // follower wants a link to the master (cleared by an explicit disconnect)
    want_master: bool,
    reconnect_at: Option<f64>,
    invalid_datagrams: u64,
    relayed: u64,
    filtered: u64,
}

impl JamSession {
    /// build a session.  The master's id is always its own, whatever the settings say.
    pub fn new(
        settings: SessionSettings,
        clock: Arc<dyn Clock>,
        signaling: Box<dyn SignalingChannel>,
        transport: Box<dyn LinkTransport>,
        observer: mpsc::Sender<SessionEvent>,
    ) -> JamSession {
        let master_id = if settings.role.is_master() {
            Some(settings.local_id.clone())
        } else {
            settings.master_id.filter(|m| !m.is_empty() && *m != settings.local_id)
        };
        info!(
            "jam_session::new - {} as {}, master: {:?}",
            settings.local_id, settings.role, master_id
        );
        let now = clock.now_ms();
        JamSession {
            links: PeerLinkManager::new(
                &settings.local_id,
                master_id.clone(),
                transport,
                settings.peer_timeout_ms,
            ),
            sync: ClockSyncEngine::new(settings.role, clock, settings.sync),
            scheduler: PlaybackScheduler::new(settings.scheduler),
            encoder: FrameEncoder::new(),
            routing: Arc::new(RoutingPolicy::new(settings.filter_mode, settings.relay_enabled)),
            trackers: HashMap::new(),
            observer,
            status_timer: IntervalTimer::new(now, STATUS_INTERVAL_MS),
            want_master: !settings.role.is_master() && master_id.is_some(),
            reconnect_at: None,
            invalid_datagrams: 0,
            relayed: 0,
            filtered: 0,
            local_id: settings.local_id,
            role: settings.role,
            master_id,
            signaling,
        }
    }
    pub fn local_id(&self) -> &str {
        &self.local_id
    }
    pub fn role(&self) -> Role {
        self.role
    }
    pub fn master_id(&self) -> Option<&str> {
        self.master_id.as_deref()
    }
    /// current routing snapshot
    pub fn routing(&self) -> Arc<RoutingPolicy> {
        self.routing.clone()
    }
    pub fn sync(&self) -> &ClockSyncEngine {
        &self.sync
    }
    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }
    pub fn link_state(&self, peer_id: &str) -> Option<LinkState> {
        self.links.state_of(peer_id)
    }
    pub fn open_peers(&self) -> Vec<String> {
        self.links.open_peers()
    }

    /// one tick of the session
    pub fn process(&mut self) {
        let now = self.sync.local_now();
        self.check_signaling(now);
        self.send_candidates();
        self.read_links(now);
        self.check_reconnect(now);
        self.send_sync_ping();
        self.present_due(now);
        self.send_status(now);
    }

    /// start negotiating a link to `peer_id`
    pub fn connect(&mut self, peer_id: &str) {
        if self.master_id.as_deref() == Some(peer_id) {
            self.want_master = !self.role.is_master();
        }
        let now = self.sync.local_now();
        if let Some(offer) = self.links.connect(peer_id, now) {
            self.signal(offer);
        }
    }
    /// drop the link to `peer_id`.  Fine to call for peers we are not linked to.
    pub fn disconnect(&mut self, peer_id: &str) {
        if self.master_id.as_deref() == Some(peer_id) {
            self.want_master = false;
            self.reconnect_at = None;
        }
        self.links.disconnect(peer_id);
    }
    /// drop every link
    pub fn shutdown(&mut self) {
        info!("jam_session::shutdown - closing {} links", self.links.peers().count());
        self.want_master = false;
        self.links.disconnect_all();
        // let the observer hear about the closes
        let now = self.sync.local_now();
        self.read_links(now);
    }

    /// stamp a local event with the master clock and send it to every open link.
    /// Returns how many links it went out on.
    pub fn send_local_event(&mut self, status: u8, data1: u8, data2: u8) -> usize {
        let buffer = self.encoder.encode(status, data1, data2, self.sync.get_now());
        let sent = self.links.broadcast(&buffer, None);
        trace!("jam_session::send_local_event - {:?} to {} links", buffer, sent);
        sent
    }
    pub fn set_buffer_ms(&mut self, buffer_ms: f64) -> Result<(), BoxError> {
        let config = self.scheduler.config().with_buffer_ms(buffer_ms)?;
        info!("jam_session::set_buffer_ms - {}", buffer_ms);
        self.scheduler.set_config(config);
        Ok(())
    }
    pub fn set_solo_set(&mut self, ids: Vec<String>) {
        self.update_routing(self.routing.with_solo_set(ids));
    }
    pub fn set_broadcast_target(&mut self, target: Option<&str>) {
        self.update_routing(self.routing.with_broadcast_target(target));
    }
    pub fn set_relay_enabled(&mut self, relay_enabled: bool) {
        self.update_routing(self.routing.with_relay(relay_enabled));
    }
    pub fn set_filter_mode(&mut self, mode: FilterMode) {
        self.update_routing(self.routing.with_mode(mode));
    }
    fn update_routing(&mut self, policy: RoutingPolicy) {
        info!("jam_session::update_routing - {}", policy);
        self.routing = Arc::new(policy);
    }
    /// all notes off: forget everything waiting to be played
    pub fn panic(&mut self) -> usize {
        self.scheduler.panic()
    }

    /// apply a command from the UI
    pub fn process_param_command(&mut self, msg: ParamMessage) {
        debug!("jam_session::process_param_command - {}", msg);
        match msg.param {
            SessionParam::Connect => self.connect(msg.svalue.trim()),
            SessionParam::Disconnect => self.disconnect(msg.svalue.trim()),
            SessionParam::SendEvent => match msg.midi_bytes() {
                Ok((status, data1, data2)) => {
                    self.send_local_event(status, data1, data2);
                }
                Err(e) => warn!("jam_session::process_param_command - bad event: {}", e),
            },
            SessionParam::SetBufferMs => {
                if let Err(e) = self.set_buffer_ms(msg.fvalue) {
                    warn!("jam_session::process_param_command - {}", e);
                }
            }
            SessionParam::SetSoloSet => self.set_solo_set(msg.id_list()),
            SessionParam::SetBroadcastTarget => {
                let target = msg.svalue.trim();
                self.set_broadcast_target(if target.is_empty() { None } else { Some(target) });
            }
            SessionParam::SetRelayMode => self.set_relay_enabled(msg.ivalue_1 != 0),
            SessionParam::SetFilterMode => match msg.svalue.parse::<FilterMode>() {
                Ok(mode) => self.set_filter_mode(mode),
                Err(e) => warn!("jam_session::process_param_command - {}", e),
            },
            SessionParam::Panic => {
                self.panic();
            }
            SessionParam::GetStatus => {
                let status = self.build_status_event();
                self.emit(SessionEvent::Status(status));
            }
        }
    }

    /// snapshot of the whole session
    pub fn build_status_event(&self) -> Value {
        let now = self.sync.local_now();
        let mut peers = self.links.get_status(now);
        if let Some(list) = peers.as_array_mut() {
            for peer in list.iter_mut() {
                let tracker = peer["peer_id"].as_str().and_then(|id| self.trackers.get(id));
                if let Some(t) = tracker {
                    peer["drops"] = json!(t.get_drops());
                    peer["outOfOrder"] = json!(t.get_late());
                }
            }
        }
        let sync = self.sync.stats();
        json!({
            "localId": self.local_id,
            "role": self.role,
            "masterId": self.master_id,
            "peers": peers,
            "sync": {
                "synced": self.sync.is_synced(),
                "rttMs": sync.rtt_ms,
                "offsetMs": sync.offset_ms,
                "jitterMs": sync.jitter_ms,
            },
            "routing": self.routing.as_json(),
            "bufferMs": self.scheduler.config().buffer_ms,
            "pending": self.scheduler.pending(),
            "late": self.scheduler.get_late(),
            "clamped": self.scheduler.get_clamped(),
            "invalidDatagrams": self.invalid_datagrams,
            "relayed": self.relayed,
            "filtered": self.filtered,
        })
    }

    fn emit(&self, event: SessionEvent) {
        let _res = self.observer.send(event);
    }
    fn signal(&mut self, msg: SignalMessage) {
        if let Err(e) = self.signaling.send(msg) {
            warn!("jam_session::signal - {}", e);
        }
    }

    // presence and negotiation
    fn check_signaling(&mut self, now: f64) {
        while let Some(event) = self.signaling.try_recv() {
            match event {
                SignalEvent::PeerJoined(peer_id) => {
                    debug!("jam_session::check_signaling - {} joined", peer_id);
                    if self.want_master && self.master_id.as_deref() == Some(peer_id.as_str()) {
                        self.connect(&peer_id);
                    }
                }
                SignalEvent::PeerLeft(peer_id) => {
                    debug!("jam_session::check_signaling - {} left", peer_id);
                    self.links.disconnect(&peer_id);
                }
                SignalEvent::Message(msg) => self.handle_signal_message(msg, now),
            }
        }
    }
    fn handle_signal_message(&mut self, msg: SignalMessage, now: f64) {
        if !(msg.is_broadcast() || msg.target == self.local_id) {
            debug!("jam_session::handle_signal_message - not for us: {}", msg.as_json());
            return;
        }
        if let Some(answer) = self.links.handle_signal(&msg.from, msg.kind, &msg.payload, now) {
            self.signal(SignalMessage::new(
                SignalType::Answer,
                &self.local_id,
                &msg.from,
                answer,
            ));
        }
    }
    fn send_candidates(&mut self) {
        for msg in self.links.take_outgoing_signals() {
            self.signal(msg);
        }
    }

    fn read_links(&mut self, now: f64) {
        for event in self.links.poll(now) {
            match event {
                PeerEvent::StateChanged { peer_id, state } => {
                    self.link_state_changed(&peer_id, state, now);
                    self.emit(SessionEvent::LinkStateChanged { peer_id, state });
                }
                PeerEvent::Data { peer_id, payload } => self.handle_datagram(&peer_id, &payload),
            }
        }
    }
    fn link_state_changed(&mut self, peer_id: &str, state: LinkState, now: f64) {
        let is_master_link = self.master_id.as_deref() == Some(peer_id) && !self.role.is_master();
        match state {
            LinkState::Open => {
                if is_master_link {
                    self.sync.start_probing(peer_id);
                }
            }
            LinkState::Closed => {
                self.sync.stop_probing(peer_id);
                self.trackers.remove(peer_id);
                if is_master_link && self.want_master {
                    self.reconnect_at = Some(now + RECONNECT_WAIT_MS);
                }
            }
            LinkState::Negotiating => {}
        }
    }
    fn check_reconnect(&mut self, now: f64) {
        let due = matches!(self.reconnect_at, Some(at) if now >= at);
        if !due {
            return;
        }
        self.reconnect_at = None;
        if let Some(master) = self.master_id.clone() {
            let present = self.signaling.members().contains(&master);
            if self.want_master && present && self.links.state_of(&master).is_none() {
                info!("jam_session::check_reconnect - reconnecting to {}", master);
                self.connect(&master);
            }
        }
    }

    // frames are exactly FRAME_SIZE bytes, sync messages are json and always longer
    fn handle_datagram(&mut self, peer_id: &str, payload: &[u8]) {
        if payload.len() == FRAME_SIZE {
            match MidiFrame::decode(payload) {
                Ok(frame) => self.handle_frame(peer_id, payload, frame),
                Err(e) => {
                    self.invalid_datagrams += 1;
                    warn!("jam_session::handle_datagram - {} from {}", e, peer_id);
                }
            }
            return;
        }
        match SyncMessage::from_bytes(payload) {
            Ok(msg) => self.handle_sync(peer_id, &msg),
            Err(e) => {
                self.invalid_datagrams += 1;
                warn!(
                    "jam_session::handle_datagram - {} bytes from {} dropped: {}",
                    payload.len(),
                    peer_id,
                    e
                );
            }
        }
    }
    fn handle_sync(&mut self, peer_id: &str, msg: &SyncMessage) {
        match self.sync.handle_message(peer_id, msg) {
            SyncOutcome::Reply(reply) => match reply.to_bytes() {
                Ok(bytes) => {
                    self.links.send_to(peer_id, &bytes);
                }
                Err(e) => warn!("jam_session::handle_sync - {}", e),
            },
            SyncOutcome::Updated(stats) => {
                debug!("jam_session::handle_sync - {}", stats);
                self.emit(SessionEvent::SyncStatsUpdated(stats));
            }
            SyncOutcome::Ignored => {}
        }
    }
    fn handle_frame(&mut self, peer_id: &str, payload: &[u8], frame: MidiFrame) {
        // a follower's master link also carries relayed frames, each with its own
        // sender's sequence space, so only the master counts gaps
        if self.role.is_master() {
            let tracker = self.trackers.entry(peer_id.to_string()).or_default();
            if let SequenceStatus::Gap(missing) = tracker.observe(frame.sequence_id) {
                debug!("jam_session::handle_frame - {} frames missing from {}", missing, peer_id);
            }
        }
        // one snapshot for the whole frame
        let routing = self.routing.clone();
        if self.role.is_master() && routing.should_relay(peer_id) {
            // same bytes, so the original timestamp survives
            let sent = self.links.broadcast(payload, Some(peer_id));
            self.relayed += 1;
            trace!("jam_session::handle_frame - relayed {} to {} links", peer_id, sent);
        }
        if !routing.admits(peer_id) {
            self.filtered += 1;
            return;
        }
        self.scheduler
            .schedule(peer_id, frame, self.sync.get_now(), self.sync.local_now());
    }
    fn send_sync_ping(&mut self) {
        if let Some((target, ping)) = self.sync.poll() {
            match ping.to_bytes() {
                Ok(bytes) => {
                    if !self.links.send_to(&target, &bytes) {
                        debug!("jam_session::send_sync_ping - could not reach {}", target);
                    }
                }
                Err(e) => warn!("jam_session::send_sync_ping - {}", e),
            }
        }
    }
    fn present_due(&mut self, now: f64) {
        for event in self.scheduler.pop_due(now) {
            self.emit(SessionEvent::EventReceived {
                peer_id: event.peer_id,
                frame: event.frame,
            });
        }
    }
    fn send_status(&mut self, now: f64) {
        if self.status_timer.expired(now) {
            self.status_timer.reset(now);
            let status = self.build_status_event();
            self.emit(SessionEvent::Status(status));
        }
    }
}

#[cfg(test)]
mod test_jam_session {
    use super::*;
    use crate::{
        clock::ManualClock,
        link::{loopback::LoopbackNetwork, LinkTransport},
        signal::MockSignalingChannel,
    };
    use std::collections::VecDeque;

    fn quiet_signaling() -> MockSignalingChannel {
        let mut mock = MockSignalingChannel::new();
        mock.expect_try_recv().returning(|| None);
        mock.expect_members().returning(Vec::new);
        mock
    }
    fn scripted_signaling(events: Vec<SignalEvent>) -> MockSignalingChannel {
        let mut queue = VecDeque::from(events);
        let mut mock = MockSignalingChannel::new();
        mock.expect_try_recv().returning(move || queue.pop_front());
        mock.expect_members().returning(Vec::new);
        mock
    }
    fn build(
        settings: SessionSettings,
        signaling: MockSignalingChannel,
        net: &LoopbackNetwork,
        clock: &ManualClock,
    ) -> (JamSession, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel();
        let transport = net.transport(&settings.local_id);
        let session = JamSession::new(
            settings,
            Arc::new(clock.clone()),
            Box::new(signaling),
            Box::new(transport),
            tx,
        );
        (session, rx)
    }
    fn frame_bytes(seq: u16, origin: f64, note: u8) -> [u8; FRAME_SIZE] {
        MidiFrame {
            sequence_id: seq,
            origin_timestamp_ms: origin,
            status: 0x90,
            data1: note,
            data2: 100,
        }
        .to_bytes()
    }
    fn received(rx: &mpsc::Receiver<SessionEvent>) -> Vec<(String, u8)> {
        rx.try_iter()
            .filter_map(|e| match e {
                SessionEvent::EventReceived { peer_id, frame } => Some((peer_id, frame.data1)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn follower_offers_when_master_joins() {
        let net = LoopbackNetwork::new();
        let clock = ManualClock::new(1000.0);
        let mut signaling = scripted_signaling(vec![
            SignalEvent::PeerJoined("someone".to_string()),
            SignalEvent::PeerJoined("m".to_string()),
        ]);
        signaling
            .expect_send()
            .withf(|msg| msg.kind == SignalType::Offer && msg.target == "m" && msg.from == "f")
            .times(1)
            .returning(|_| Ok(()));
        let (mut session, rx) = build(
            SessionSettings::new("f", Role::Follower, Some("m")),
            signaling,
            &net,
            &clock,
        );
        session.process();
        assert_eq!(session.link_state("m"), Some(LinkState::Negotiating));
        assert_eq!(session.link_state("someone"), None);
        let states: Vec<SessionEvent> = rx.try_iter().collect();
        assert!(states.contains(&SessionEvent::LinkStateChanged {
            peer_id: "m".to_string(),
            state: LinkState::Negotiating
        }));
    }
    #[test]
    fn master_answers_offers() {
        let net = LoopbackNetwork::new();
        let clock = ManualClock::new(1000.0);
        let (_link, offer) = net.transport("f").create_offer("m").unwrap();
        let mut signaling = scripted_signaling(vec![
            SignalEvent::PeerJoined("f".to_string()),
            SignalEvent::Message(SignalMessage::new(SignalType::Offer, "f", "m", offer)),
            // not for us
            SignalEvent::Message(SignalMessage::new(SignalType::Offer, "f", "x", json!({}))),
        ]);
        signaling
            .expect_send()
            .withf(|msg| msg.kind == SignalType::Answer && msg.target == "f")
            .times(1)
            .returning(|_| Ok(()));
        let (mut session, _rx) = build(SessionSettings::new("m", Role::Master, None), signaling, &net, &clock);
        session.process();
        assert_eq!(session.master_id(), Some("m"));
        assert_eq!(session.link_state("f"), Some(LinkState::Negotiating));
    }
    #[test]
    fn signaling_failures_are_not_fatal() {
        let net = LoopbackNetwork::new();
        let clock = ManualClock::new(0.0);
        let mut signaling = quiet_signaling();
        signaling
            .expect_send()
            .returning(|_| Err("room is down".into()));
        let (mut session, _rx) = build(SessionSettings::new("f", Role::Follower, None), signaling, &net, &clock);
        session.connect("m");
        session.process();
        assert_eq!(session.link_state("m"), Some(LinkState::Negotiating));
    }
    #[test]
    fn frames_are_buffered_then_presented() {
        let net = LoopbackNetwork::new();
        let clock = ManualClock::new(1000.0);
        let (mut session, rx) = build(SessionSettings::new("m", Role::Master, None), quiet_signaling(), &net, &clock);
        // sent at 980, buffer 150: plays at 1130
        session.handle_datagram("f1", &frame_bytes(0, 980.0, 60));
        session.process();
        assert!(received(&rx).is_empty());
        clock.set_ms(1130.0);
        session.process();
        assert_eq!(received(&rx), vec![("f1".to_string(), 60)]);
    }
    #[test]
    fn late_frames_play_now() {
        let net = LoopbackNetwork::new();
        let clock = ManualClock::new(1500.0);
        let (mut session, rx) = build(SessionSettings::new("m", Role::Master, None), quiet_signaling(), &net, &clock);
        // 500 on the wire against a 150 buffer
        session.handle_datagram("f1", &frame_bytes(0, 1000.0, 61));
        session.process();
        assert_eq!(received(&rx), vec![("f1".to_string(), 61)]);
        assert_eq!(session.scheduler().get_late(), 1);
    }
    #[test]
    fn solo_and_allow_list() {
        let net = LoopbackNetwork::new();
        let clock = ManualClock::new(1000.0);
        let (mut session, rx) = build(SessionSettings::new("m", Role::Master, None), quiet_signaling(), &net, &clock);
        session.set_solo_set(vec!["f2".to_string()]);
        session.handle_datagram("f1", &frame_bytes(0, 1000.0, 1));
        session.handle_datagram("f2", &frame_bytes(0, 1000.0, 2));
        session.set_solo_set(vec![]);
        session.handle_datagram("f1", &frame_bytes(1, 1000.0, 3));
        session.set_filter_mode(FilterMode::AllowList);
        session.handle_datagram("f1", &frame_bytes(2, 1000.0, 4));
        clock.advance_ms(200.0);
        session.process();
        let notes: Vec<u8> = received(&rx).iter().map(|(_, n)| *n).collect();
        assert_eq!(notes, vec![2, 3]);
        assert_eq!(session.build_status_event()["filtered"], 2);
    }
    #[test]
    fn junk_datagrams_are_counted_and_dropped() {
        let net = LoopbackNetwork::new();
        let clock = ManualClock::new(1000.0);
        let (mut session, rx) = build(SessionSettings::new("m", Role::Master, None), quiet_signaling(), &net, &clock);
        session.handle_datagram("f1", &[1, 2, 3]);
        session.handle_datagram("f1", &[0u8; 14]);
        session.handle_datagram("f1", br#"{"type":"SOMETHING_ELSE"}"#);
        session.process();
        assert_eq!(session.build_status_event()["invalidDatagrams"], 3);
        assert!(received(&rx).is_empty());
    }
    #[test]
    fn commands_from_the_ui() {
        let net = LoopbackNetwork::new();
        let clock = ManualClock::new(1000.0);
        let (mut session, rx) = build(SessionSettings::new("m", Role::Master, None), quiet_signaling(), &net, &clock);
        let mut msg = ParamMessage::new(SessionParam::SetBufferMs);
        msg.fvalue = 250.0;
        session.process_param_command(msg.clone());
        assert_eq!(session.scheduler().config().buffer_ms, 250.0);
        msg.fvalue = -5.0;
        session.process_param_command(msg);
        assert_eq!(session.scheduler().config().buffer_ms, 250.0);

        session.process_param_command(ParamMessage::with_str(SessionParam::SetSoloSet, "f1,f2"));
        assert_eq!(session.routing().solo_set.len(), 2);
        session.process_param_command(ParamMessage::with_str(SessionParam::SetBroadcastTarget, "f1"));
        let mut relay = ParamMessage::new(SessionParam::SetRelayMode);
        relay.ivalue_1 = 1;
        session.process_param_command(relay);
        assert!(session.routing().should_relay("f1"));
        session.process_param_command(ParamMessage::with_str(SessionParam::SetBroadcastTarget, ""));
        assert_eq!(session.routing().broadcast_target, None);
        session.process_param_command(ParamMessage::with_str(SessionParam::SetFilterMode, "allow_list"));
        assert_eq!(session.routing().mode, FilterMode::AllowList);

        session.process_param_command(ParamMessage::new(SessionParam::GetStatus));
        let status = rx
            .try_iter()
            .find_map(|e| match e {
                SessionEvent::Status(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(status["bufferMs"], 250.0);
        assert_eq!(status["role"], "master");
        assert_eq!(status["routing"]["mode"], "allow_list");
    }
    #[test]
    fn panic_clears_pending() {
        let net = LoopbackNetwork::new();
        let clock = ManualClock::new(1000.0);
        let (mut session, rx) = build(SessionSettings::new("m", Role::Master, None), quiet_signaling(), &net, &clock);
        session.handle_datagram("f1", &frame_bytes(0, 1000.0, 60));
        session.handle_datagram("f1", &frame_bytes(1, 1000.0, 62));
        assert_eq!(session.panic(), 2);
        clock.advance_ms(500.0);
        session.process();
        assert!(received(&rx).is_empty());
    }
    #[test]
    fn nothing_to_send_to() {
        let net = LoopbackNetwork::new();
        let clock = ManualClock::new(1000.0);
        let (mut session, _rx) = build(SessionSettings::new("f", Role::Follower, Some("m")), quiet_signaling(), &net, &clock);
        assert_eq!(session.send_local_event(0x90, 60, 100), 0);
        // a follower never answers pings
        session.handle_datagram("m", &SyncMessage::Ping { t0: 1.0 }.to_bytes().unwrap());
        assert!(!session.sync().is_synced());
    }
    #[test]
    fn master_counts_gaps_per_sender() {
        let net = LoopbackNetwork::new();
        let clock = ManualClock::new(1000.0);
        let (mut session, _rx) = build(SessionSettings::new("m", Role::Master, None), quiet_signaling(), &net, &clock);
        session.handle_datagram("f1", &frame_bytes(0, 1000.0, 60));
        session.handle_datagram("f1", &frame_bytes(3, 1000.0, 61));
        session.handle_datagram("f2", &frame_bytes(500, 1000.0, 62));
        assert_eq!(session.trackers["f1"].get_drops(), 2);
        assert_eq!(session.trackers["f2"].get_drops(), 0);
    }
    #[test]
    fn follower_does_not_mix_relayed_sequences() {
        let net = LoopbackNetwork::new();
        let clock = ManualClock::new(1000.0);
        let (mut session, rx) = build(SessionSettings::new("f3", Role::Follower, Some("m")), quiet_signaling(), &net, &clock);
        // the master's own frames and frames relayed from f1 share the link to "m"
        session.handle_datagram("m", &frame_bytes(10, 1000.0, 60));
        session.handle_datagram("m", &frame_bytes(4000, 1000.0, 61));
        session.handle_datagram("m", &frame_bytes(11, 1000.0, 62));
        assert!(session.trackers.is_empty());
        clock.advance_ms(150.0);
        session.process();
        assert_eq!(received(&rx).len(), 3);
    }
    #[test]
    fn events_as_json() {
        let ev = SessionEvent::LinkStateChanged {
            peer_id: "f1".to_string(),
            state: LinkState::Open,
        };
        assert_eq!(ev.as_json()["state"], "open");
        let ev = SessionEvent::EventReceived {
            peer_id: "f1".to_string(),
            frame: MidiFrame::decode(&frame_bytes(7, 12.5, 60)).unwrap(),
        };
        let v = ev.as_json();
        assert_eq!(v["type"], "event");
        assert_eq!(v["sequence"], 7);
        assert_eq!(v["data1"], 60);
    }
}
