//! in-process signaling relay
//!
//! Every endpoint that joins the hub gets an inbox.  Joining or leaving is announced to
//! everybody else, and messages are delivered in the order they were sent.
use log::debug;
use simple_error::bail;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
};

use super::{signal_message::SignalMessage, SignalEvent, SignalingChannel};
use crate::common::box_error::BoxError;

#[derive(Default)]
struct HubInner {
    inboxes: BTreeMap<String, VecDeque<SignalEvent>>,
}

#[derive(Clone, Default)]
pub struct LocalSignalHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LocalSignalHub {
    pub fn new() -> LocalSignalHub {
        LocalSignalHub::default()
    }
    /// join the room as `id`
    pub fn join(&self, id: &str) -> Result<LocalSignaling, BoxError> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => bail!("signal hub lock poisoned"),
        };
        if inner.inboxes.contains_key(id) {
            bail!("{} is already in the room", id);
        }
        let mut inbox = VecDeque::new();
        for (other, their_inbox) in inner.inboxes.iter_mut() {
            their_inbox.push_back(SignalEvent::PeerJoined(id.to_string()));
            inbox.push_back(SignalEvent::PeerJoined(other.clone()));
        }
        inner.inboxes.insert(id.to_string(), inbox);
        debug!("local_hub::join - {} joined", id);
        Ok(LocalSignaling {
            id: id.to_string(),
            hub: self.clone(),
        })
    }
    pub fn members(&self) -> Vec<String> {
        match self.inner.lock() {
            Ok(inner) => inner.inboxes.keys().cloned().collect(),
            Err(_) => vec![],
        }
    }
}

/// one endpoint's view of the hub
pub struct LocalSignaling {
    id: String,
    hub: LocalSignalHub,
}

impl LocalSignaling {
    pub fn id(&self) -> &str {
        &self.id
    }
    /// leave the room.  Everybody else hears about it.
    pub fn leave(&self) {
        if let Ok(mut inner) = self.hub.inner.lock() {
            if inner.inboxes.remove(&self.id).is_some() {
                for inbox in inner.inboxes.values_mut() {
                    inbox.push_back(SignalEvent::PeerLeft(self.id.clone()));
                }
            }
        }
    }
}

impl SignalingChannel for LocalSignaling {
    fn send(&mut self, msg: SignalMessage) -> Result<(), BoxError> {
        let mut inner = match self.hub.inner.lock() {
            Ok(guard) => guard,
            Err(_) => bail!("signal hub lock poisoned"),
        };
        if msg.is_broadcast() {
            for (id, inbox) in inner.inboxes.iter_mut() {
                if *id != self.id {
                    inbox.push_back(SignalEvent::Message(msg.clone()));
                }
            }
            return Ok(());
        }
        match inner.inboxes.get_mut(&msg.target) {
            Some(inbox) => {
                inbox.push_back(SignalEvent::Message(msg));
                Ok(())
            }
            None => bail!("no endpoint {} in the room", msg.target),
        }
    }
    fn try_recv(&mut self) -> Option<SignalEvent> {
        let mut inner = self.hub.inner.lock().ok()?;
        let event = inner.inboxes.get_mut(&self.id)?.pop_front();
        event
    }
    fn members(&self) -> Vec<String> {
        self.hub
            .members()
            .into_iter()
            .filter(|m| *m != self.id)
            .collect()
    }
}
