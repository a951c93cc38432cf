//! Thread used to read/write signaling messages to/from the websocket room, and the
//! [`SignalingChannel`] that talks to that thread.
use log::{debug, error, info, warn};
use serde_json::Value;
use std::{
    collections::{HashSet, VecDeque},
    sync::mpsc,
    thread::{self, sleep},
    time::Duration,
};

use super::{
    room::Room,
    signal_message::{SignalMessage, SignalType, BROADCAST_TARGET},
    SignalEvent, SignalingChannel,
};
use crate::common::box_error::BoxError;

// wait between attempts to reach the signaling server
const RECONNECT_WAIT: Duration = Duration::from_secs(2);

/// What the room thread hands back to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// (re)joined the room, anything said before is gone
    Joined,
    Message(SignalMessage),
}

/// Used for dependency injection to test [`start_room_signaling`]
pub type SignalThreadFn = fn(
    &str,
    &str,
    mpsc::Sender<RoomEvent>,
    mpsc::Receiver<SignalMessage>,
) -> Result<(), BoxError>;

/// start a thread with this function.  Pass it the room name, the websocket url to use,
/// and two channels.  The first tells the caller about every join and forwards the
/// signaling messages heard in the room.  The second carries messages from the caller
/// to be said in the room.
///
/// Never returns unless the caller hangs up its end of the channels.
pub fn websocket_thread(
    room_name: &str,
    ws_url: &str,
    ws_tx: mpsc::Sender<RoomEvent>,
    ws_rx: mpsc::Receiver<SignalMessage>,
) -> Result<(), BoxError> {
    info!(
        "websocket::websocket_thread - room: {}, ws_url: {}",
        room_name, ws_url
    );
    loop {
        match Room::new(room_name, ws_url) {
            Ok(mut room) => {
                match room.join_room() {
                    Ok(()) => ws_tx.send(RoomEvent::Joined)?,
                    Err(e) => {
                        warn!("websocket::websocket_thread - join failed: {}", e);
                        room.reset();
                    }
                }
                while room.is_connected() {
                    match room.get_message() {
                        Ok(Some(v)) => forward_room_message(&v, &ws_tx)?,
                        Ok(None) => {}
                        Err(e) => {
                            warn!("websocket::websocket_thread - room error: {}", e);
                            room.reset();
                        }
                    }
                    // anything to say?
                    loop {
                        match ws_rx.try_recv() {
                            Ok(m) => {
                                if let Err(e) = room.send_message(&m.as_json()) {
                                    warn!("websocket::websocket_thread - send failed: {}", e);
                                    room.reset();
                                    break;
                                }
                            }
                            Err(mpsc::TryRecvError::Empty) => break,
                            Err(mpsc::TryRecvError::Disconnected) => {
                                info!("websocket::websocket_thread - caller hung up");
                                return Ok(());
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!("websocket::websocket_thread - cannot reach {}: {}", ws_url, e);
            }
        }
        // Failed to connect or lost the room.  Wait before trying again
        sleep(RECONNECT_WAIT);
    }
}

// pull the signaling message out of a chat room wrapper
fn forward_room_message(v: &Value, ws_tx: &mpsc::Sender<RoomEvent>) -> Result<(), BoxError> {
    match v["message"].as_str() {
        Some(data) => match SignalMessage::from_string(data) {
            Ok(msg) => ws_tx.send(RoomEvent::Message(msg))?,
            Err(e) => debug!("websocket::forward_room_message - not signaling: {} ({})", data, e),
        },
        None => debug!("websocket::forward_room_message - no message field: {}", v),
    }
    Ok(())
}

/// [`SignalingChannel`] over a websocket room thread.
///
/// Presence is built from hello/bye messages: we say hello to the room every time the
/// thread joins it, and answer every new hello with a hello addressed just to the newcomer.
pub struct RoomSignaling {
    local_id: String,
    to_ws: mpsc::Sender<SignalMessage>,
    from_ws: mpsc::Receiver<RoomEvent>,
    members: HashSet<String>,
    pending: VecDeque<SignalEvent>,
}

impl RoomSignaling {
    pub fn new(
        local_id: &str,
        to_ws: mpsc::Sender<SignalMessage>,
        from_ws: mpsc::Receiver<RoomEvent>,
    ) -> RoomSignaling {
        RoomSignaling {
            local_id: local_id.to_string(),
            to_ws,
            from_ws,
            members: HashSet::new(),
            pending: VecDeque::new(),
        }
    }
    /// tell the room we are here
    pub fn announce(&mut self) -> Result<(), BoxError> {
        self.send(SignalMessage::new(
            SignalType::Hello,
            &self.local_id,
            BROADCAST_TARGET,
            Value::Null,
        ))
    }
    /// tell the room we are leaving
    pub fn leave(&mut self) -> Result<(), BoxError> {
        self.members.clear();
        self.send(SignalMessage::new(
            SignalType::Bye,
            &self.local_id,
            BROADCAST_TARGET,
            Value::Null,
        ))
    }
    // turn one raw message into zero or more events
    fn accept(&mut self, msg: SignalMessage) {
        if msg.from == self.local_id {
            return;
        }
        if !(msg.is_broadcast() || msg.target == self.local_id) {
            return;
        }
        match msg.kind {
            SignalType::Hello => {
                if self.members.insert(msg.from.clone()) {
                    if msg.is_broadcast() {
                        // newcomer does not know about us yet
                        let reply =
                            SignalMessage::new(SignalType::Hello, &self.local_id, &msg.from, Value::Null);
                        if let Err(e) = self.send(reply) {
                            warn!("websocket::accept - hello reply failed: {}", e);
                        }
                    }
                    self.pending.push_back(SignalEvent::PeerJoined(msg.from));
                }
            }
            SignalType::Bye => {
                if self.members.remove(&msg.from) {
                    self.pending.push_back(SignalEvent::PeerLeft(msg.from));
                }
            }
            _ => {
                if self.members.insert(msg.from.clone()) {
                    // missed their hello
                    self.pending.push_back(SignalEvent::PeerJoined(msg.from.clone()));
                }
                self.pending.push_back(SignalEvent::Message(msg));
            }
        }
    }
}

impl SignalingChannel for RoomSignaling {
    fn send(&mut self, msg: SignalMessage) -> Result<(), BoxError> {
        self.to_ws.send(msg)?;
        Ok(())
    }
    fn try_recv(&mut self) -> Option<SignalEvent> {
        while self.pending.is_empty() {
            match self.from_ws.try_recv() {
                Ok(RoomEvent::Joined) => {
                    // members who joined while we were away never heard our hello
                    debug!("websocket::try_recv - {} joined the room", self.local_id);
                    if let Err(e) = self.announce() {
                        warn!("websocket::try_recv - announce failed: {}", e);
                    }
                }
                Ok(RoomEvent::Message(msg)) => self.accept(msg),
                Err(_) => break,
            }
        }
        self.pending.pop_front()
    }
    fn members(&self) -> Vec<String> {
        self.members.iter().cloned().collect()
    }
}

/// spawn the websocket thread for a room and hand back the channel that talks to it
///
/// `thread_fn` defaults to [`websocket_thread`].
pub fn start_room_signaling(
    local_id: &str,
    room_name: &str,
    ws_url: &str,
    thread_fn: Option<SignalThreadFn>,
) -> Result<(RoomSignaling, thread::JoinHandle<()>), BoxError> {
    let thread_fn = thread_fn.unwrap_or(websocket_thread);
    let (to_ws_tx, to_ws_rx) = mpsc::channel();
    let (from_ws_tx, from_ws_rx) = mpsc::channel();

    let room = room_name.to_string();
    let url = ws_url.to_string();
    let handle = thread::Builder::new()
        .name("signaling".to_string())
        .spawn(move || {
            if let Err(e) = thread_fn(&room, &url, from_ws_tx, to_ws_rx) {
                error!("websocket::start_room_signaling - thread exited: {}", e);
            }
        })?;

    let signaling = RoomSignaling::new(local_id, to_ws_tx, from_ws_rx);
    debug!("websocket::start_room_signaling - {} waiting to join {}", local_id, room_name);
    Ok((signaling, handle))
}

#[cfg(test)]
mod test_websocket {
    use super::*;
    use serde_json::json;

    fn wired(local: &str) -> (RoomSignaling, mpsc::Sender<RoomEvent>, mpsc::Receiver<SignalMessage>) {
        let (to_ws_tx, to_ws_rx) = mpsc::channel();
        let (from_ws_tx, from_ws_rx) = mpsc::channel();
        (RoomSignaling::new(local, to_ws_tx, from_ws_rx), from_ws_tx, to_ws_rx)
    }

    #[test]
    fn hello_makes_a_member_and_gets_answered() {
        let (mut sig, inject, said) = wired("me");
        inject
            .send(RoomEvent::Message(SignalMessage::new(SignalType::Hello, "you", "*", Value::Null)))
            .unwrap();
        assert_eq!(sig.try_recv(), Some(SignalEvent::PeerJoined("you".to_string())));
        assert_eq!(sig.members(), vec!["you".to_string()]);
        let reply = said.try_recv().unwrap();
        assert_eq!(reply.kind, SignalType::Hello);
        assert_eq!(reply.target, "you");
        // second hello is not news
        inject
            .send(RoomEvent::Message(SignalMessage::new(SignalType::Hello, "you", "me", Value::Null)))
            .unwrap();
        assert_eq!(sig.try_recv(), None);
    }
    #[test]
    fn messages_for_others_are_dropped() {
        let (mut sig, inject, _said) = wired("me");
        inject
            .send(RoomEvent::Message(SignalMessage::new(SignalType::Offer, "a", "b", json!({}))))
            .unwrap();
        inject
            .send(RoomEvent::Message(SignalMessage::new(SignalType::Offer, "me", "*", json!({}))))
            .unwrap();
        assert_eq!(sig.try_recv(), None);
    }
    #[test]
    fn offer_from_unknown_peer_joins_them_first() {
        let (mut sig, inject, _said) = wired("me");
        let offer = SignalMessage::new(SignalType::Offer, "f1", "me", json!({"session": 1}));
        inject.send(RoomEvent::Message(offer.clone())).unwrap();
        assert_eq!(sig.try_recv(), Some(SignalEvent::PeerJoined("f1".to_string())));
        assert_eq!(sig.try_recv(), Some(SignalEvent::Message(offer)));
    }
    #[test]
    fn bye_removes_member() {
        let (mut sig, inject, _said) = wired("me");
        inject
            .send(RoomEvent::Message(SignalMessage::new(SignalType::Hello, "you", "me", Value::Null)))
            .unwrap();
        inject
            .send(RoomEvent::Message(SignalMessage::new(SignalType::Bye, "you", "*", Value::Null)))
            .unwrap();
        assert_eq!(sig.try_recv(), Some(SignalEvent::PeerJoined("you".to_string())));
        assert_eq!(sig.try_recv(), Some(SignalEvent::PeerLeft("you".to_string())));
        assert!(sig.members().is_empty());
    }
    #[test]
    fn every_join_says_hello_again() {
        let (mut sig, inject, said) = wired("me");
        inject.send(RoomEvent::Joined).unwrap();
        assert_eq!(sig.try_recv(), None);
        let hello = said.try_recv().unwrap();
        assert_eq!(hello.kind, SignalType::Hello);
        assert_eq!(hello.from, "me");
        assert!(hello.is_broadcast());

        // lost the socket, the thread joined again
        inject.send(RoomEvent::Joined).unwrap();
        assert_eq!(sig.try_recv(), None);
        let hello = said.try_recv().unwrap();
        assert_eq!(hello.kind, SignalType::Hello);
        assert!(hello.is_broadcast());
        assert!(said.try_recv().is_err());

        // somebody who arrived while we were gone answers the new hello
        inject
            .send(RoomEvent::Message(SignalMessage::new(SignalType::Hello, "late", "me", Value::Null)))
            .unwrap();
        assert_eq!(sig.try_recv(), Some(SignalEvent::PeerJoined("late".to_string())));
    }

    // joins once, then echoes everything said back into the room
    fn mock_websocket_thread(
        room: &str,
        ws_url: &str,
        ws_tx: mpsc::Sender<RoomEvent>,
        ws_rx: mpsc::Receiver<SignalMessage>,
    ) -> Result<(), BoxError> {
        assert_eq!(room, "test_room");
        assert_eq!(ws_url, "ws://test.com");
        ws_tx.send(RoomEvent::Joined)?;
        for mut message in ws_rx {
            // pretend somebody else said it to us
            message.from = "echo".to_string();
            message.target = "me".to_string();
            let _ = ws_tx.send(RoomEvent::Message(message));
        }
        Ok(())
    }

    #[test]
    fn start_with_injected_thread() {
        let (mut sig, _handle) =
            start_room_signaling("me", "test_room", "ws://test.com", Some(mock_websocket_thread))
                .unwrap();
        // our announce comes back as a hello from "echo"
        let mut got = None;
        for _ in 0..100 {
            got = sig.try_recv();
            if got.is_some() {
                break;
            }
            sleep(Duration::from_millis(5));
        }
        assert_eq!(got, Some(SignalEvent::PeerJoined("echo".to_string())));
    }
}
