//! Data links that never leave the process
//!
//! Every link is an endpoint in a shared [`LoopbackNetwork`].  The offer and answer carry
//! endpoint ids.  Both ends open when the initiator applies the answer.  Used by the tests
//! and handy for running several sessions in one process.
use log::debug;
use serde_json::{json, Value};
use simple_error::bail;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use super::{next_link_id, DataLink, LinkEvent, LinkTransport};
use crate::common::box_error::BoxError;

pub const TRANSPORT_NAME: &str = "loopback";

struct Endpoint {
    owner: String,
    peer: Option<u64>,
    open: bool,
    inbox: VecDeque<Vec<u8>>,
}

#[derive(Default)]
struct NetInner {
    endpoints: HashMap<u64, Endpoint>,
    dropping: bool,
}

/// shared switchboard for loopback links
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetInner>>,
}

impl LoopbackNetwork {
    pub fn new() -> LoopbackNetwork {
        LoopbackNetwork::default()
    }
    /// a transport making links owned by `local_id`
    pub fn transport(&self, local_id: &str) -> LoopbackTransport {
        LoopbackTransport {
            local_id: local_id.to_string(),
            net: self.clone(),
        }
    }
    /// number of links that have not been closed
    pub fn live_links(&self) -> usize {
        self.lock().map(|inner| inner.endpoints.len()).unwrap_or(0)
    }
    /// live links owned by `owner`
    pub fn links_owned_by(&self, owner: &str) -> usize {
        self.lock()
            .map(|inner| inner.endpoints.values().filter(|e| e.owner == owner).count())
            .unwrap_or(0)
    }
    /// when set every datagram is silently lost
    pub fn set_dropping(&self, dropping: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.dropping = dropping;
        }
    }
    fn lock(&self) -> Result<MutexGuard<'_, NetInner>, BoxError> {
        match self.inner.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => bail!("loopback network lock poisoned"),
        }
    }
    fn add_endpoint(&self, owner: &str, peer: Option<u64>) -> Result<u64, BoxError> {
        let id = next_link_id();
        self.lock()?.endpoints.insert(
            id,
            Endpoint {
                owner: owner.to_string(),
                peer,
                open: false,
                inbox: VecDeque::new(),
            },
        );
        Ok(id)
    }
}

fn endpoint_of(description: &Value) -> Result<u64, BoxError> {
    if description["transport"] != TRANSPORT_NAME {
        bail!("not a loopback description: {}", description);
    }
    match description["endpoint"].as_u64() {
        Some(id) => Ok(id),
        None => bail!("no endpoint in description: {}", description),
    }
}

pub struct LoopbackLink {
    id: u64,
    net: LoopbackNetwork,
    has_remote: bool,
    open_reported: bool,
    closed: bool,
}

impl LoopbackLink {
    fn new(id: u64, net: LoopbackNetwork, has_remote: bool) -> LoopbackLink {
        LoopbackLink {
            id,
            net,
            has_remote,
            open_reported: false,
            closed: false,
        }
    }
    fn description(&self) -> Value {
        json!({ "transport": TRANSPORT_NAME, "endpoint": self.id })
    }
}

impl DataLink for LoopbackLink {
    fn link_id(&self) -> u64 {
        self.id
    }
    fn send(&mut self, payload: &[u8]) -> Result<(), BoxError> {
        let mut inner = self.net.lock()?;
        let peer = match inner.endpoints.get(&self.id) {
            Some(Endpoint {
                open: true,
                peer: Some(peer),
                ..
            }) => *peer,
            _ => bail!("loopback link {} is not open", self.id),
        };
        if inner.dropping {
            return Ok(());
        }
        match inner.endpoints.get_mut(&peer) {
            Some(remote) => {
                remote.inbox.push_back(payload.to_vec());
                Ok(())
            }
            None => bail!("loopback link {} lost its far end", self.id),
        }
    }
    fn set_remote_description(&mut self, description: &Value) -> Result<(), BoxError> {
        let remote = endpoint_of(description)?;
        let mut inner = self.net.lock()?;
        match inner.endpoints.get(&remote) {
            Some(ep) if ep.peer == Some(self.id) => {}
            _ => bail!("endpoint {} did not answer us", remote),
        }
        if let Some(ep) = inner.endpoints.get_mut(&self.id) {
            ep.peer = Some(remote);
            ep.open = true;
        }
        if let Some(ep) = inner.endpoints.get_mut(&remote) {
            ep.open = true;
        }
        self.has_remote = true;
        Ok(())
    }
    fn has_remote_description(&self) -> bool {
        self.has_remote
    }
    fn add_remote_candidate(&mut self, _candidate: &Value) -> Result<(), BoxError> {
        // nothing to route
        Ok(())
    }
    fn poll(&mut self, _now_ms: f64) -> Vec<LinkEvent> {
        if self.closed {
            return vec![];
        }
        let mut events = vec![];
        let mut inner = match self.net.lock() {
            Ok(inner) => inner,
            Err(e) => return vec![LinkEvent::Closed(e.to_string())],
        };
        let far_end_gone = match inner.endpoints.get(&self.id) {
            Some(ep) => ep.peer.map_or(false, |p| !inner.endpoints.contains_key(&p)),
            None => true,
        };
        if let Some(ep) = inner.endpoints.get_mut(&self.id) {
            if ep.open && !self.open_reported {
                self.open_reported = true;
                events.push(LinkEvent::Open);
            }
            events.extend(ep.inbox.drain(..).map(LinkEvent::Data));
        }
        if far_end_gone {
            inner.endpoints.remove(&self.id);
            self.closed = true;
            events.push(LinkEvent::Closed("far end closed".to_string()));
        }
        events
    }
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Ok(mut inner) = self.net.lock() {
            inner.endpoints.remove(&self.id);
        }
        debug!("loopback::close - link {}", self.id);
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct LoopbackTransport {
    local_id: String,
    net: LoopbackNetwork,
}

impl LinkTransport for LoopbackTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }
    fn create_offer(&mut self, _peer_id: &str) -> Result<(Box<dyn DataLink>, Value), BoxError> {
        let id = self.net.add_endpoint(&self.local_id, None)?;
        let link = LoopbackLink::new(id, self.net.clone(), false);
        let offer = link.description();
        Ok((Box::new(link), offer))
    }
    fn accept_offer(
        &mut self,
        _peer_id: &str,
        offer: &Value,
    ) -> Result<(Box<dyn DataLink>, Value), BoxError> {
        let remote = endpoint_of(offer)?;
        if !self.net.lock()?.endpoints.contains_key(&remote) {
            bail!("offer for unknown endpoint {}", remote);
        }
        let id = self.net.add_endpoint(&self.local_id, Some(remote))?;
        let link = LoopbackLink::new(id, self.net.clone(), true);
        let answer = link.description();
        Ok((Box::new(link), answer))
    }
}
