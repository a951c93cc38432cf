//! Data links over plain UDP sockets
//!
//! Each link gets its own socket bound to an ephemeral port.  Negotiation:
//! - the description (offer or answer) is `{"transport": "udp", "session": <u32>}`
//! - the only candidate is the socket address we advertise, `{"addr": "ip:port"}`
//! - once both sides know each other's session and candidates they fire probes at every
//!   remote candidate.  The first matching probe (or ack of our probe) pins the remote
//!   address and the link opens.
//!
//! After that the link is a bare datagram pipe.  Nothing is retransmitted or reordered.
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use serde_json::{json, Value};
use simple_error::bail;
use socket2::{Domain, SockAddr, Socket, Type};
use std::{
    fmt,
    io::ErrorKind,
    net::{IpAddr, SocketAddr, UdpSocket},
};

use super::{next_link_id, DataLink, LinkEvent, LinkState, LinkTransport};
use crate::common::{box_error::BoxError, stream_time_stat::IntervalTimer};

pub const TRANSPORT_NAME: &str = "udp";
// "RJP" + kind + session
const PROBE_SIZE: usize = 8;
const PROBE_MAGIC: &[u8; 3] = b"RJP";
const PROBE_ASK: u8 = b'?';
const PROBE_ACK: u8 = b'!';
const PROBE_INTERVAL_MS: f64 = 250.0;
const MAX_DATAGRAM: usize = 1500;
// low delay
const IP_TOS: u32 = 0x10;

fn probe_packet(kind: u8, session: u32) -> [u8; PROBE_SIZE] {
    let mut buf = [0u8; PROBE_SIZE];
    buf[..3].copy_from_slice(PROBE_MAGIC);
    buf[3] = kind;
    LittleEndian::write_u32(&mut buf[4..], session);
    buf
}

// (kind, session) if the datagram is a probe
fn parse_probe(buf: &[u8]) -> Option<(u8, u32)> {
    if buf.len() != PROBE_SIZE || &buf[..3] != PROBE_MAGIC {
        return None;
    }
    match buf[3] {
        PROBE_ASK | PROBE_ACK => Some((buf[3], LittleEndian::read_u32(&buf[4..]))),
        _ => None,
    }
}

fn parse_session(description: &Value) -> Result<u32, BoxError> {
    if description["transport"] != TRANSPORT_NAME {
        bail!("not a udp description: {}", description);
    }
    match description["session"].as_u64() {
        Some(s) if s <= u32::MAX as u64 => Ok(s as u32),
        _ => bail!("bad session in description: {}", description),
    }
}

/// a udp socket bound to `ip`, any port, marked low delay, non-blocking
pub fn bind_socket(ip: IpAddr) -> Result<UdpSocket, BoxError> {
    let domain = match ip {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let raw_sock = Socket::new(domain, Type::DGRAM, None)?;
    if ip.is_ipv4() {
        raw_sock.set_tos(IP_TOS)?;
    }
    raw_sock.bind(&SockAddr::from(SocketAddr::new(ip, 0)))?;
    raw_sock.set_nonblocking(true)?;
    Ok(UdpSocket::from(raw_sock))
}

pub struct UdpLink {
    link_id: u64,
    peer_id: String,
    sock: Option<UdpSocket>,
    state: LinkState,
    local_session: u32,
    remote_session: Option<u32>,
    local_candidates: Vec<Value>,
    remote_candidates: Vec<SocketAddr>,
    remote: Option<SocketAddr>,
    probe_timer: IntervalTimer,
    open_reported: bool,
}

impl UdpLink {
    fn new(peer_id: &str, sock: UdpSocket, advertise_ip: IpAddr) -> Result<UdpLink, BoxError> {
        let port = sock.local_addr()?.port();
        let candidate = SocketAddr::new(advertise_ip, port);
        Ok(UdpLink {
            link_id: next_link_id(),
            peer_id: peer_id.to_string(),
            sock: Some(sock),
            state: LinkState::Negotiating,
            local_session: rand::random::<u32>(),
            remote_session: None,
            local_candidates: vec![json!({ "addr": candidate.to_string() })],
            remote_candidates: vec![],
            remote: None,
            probe_timer: IntervalTimer::expired_at(0.0, PROBE_INTERVAL_MS),
            open_reported: false,
        })
    }
    fn description(&self) -> Value {
        json!({ "transport": TRANSPORT_NAME, "session": self.local_session })
    }
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.as_ref().and_then(|s| s.local_addr().ok())
    }
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
    pub fn state(&self) -> LinkState {
        self.state
    }

    fn send_probes(&mut self, now_ms: f64) {
        if let Some(sock) = &self.sock {
            let probe = probe_packet(PROBE_ASK, self.local_session);
            for addr in &self.remote_candidates {
                if let Err(e) = sock.send_to(&probe, addr) {
                    debug!("udp_link::send_probes - probe to {} failed: {}", addr, e);
                }
            }
        }
        self.probe_timer.reset(now_ms);
    }

    fn handle_probe(&mut self, kind: u8, session: u32, src: SocketAddr) {
        if self.remote_session != Some(session) {
            debug!("udp_link::handle_probe - stale probe from {} ignored", src);
            return;
        }
        if let Some(remote) = self.remote {
            if remote != src {
                return;
            }
        }
        if kind == PROBE_ASK {
            if let Some(sock) = &self.sock {
                let _ = sock.send_to(&probe_packet(PROBE_ACK, self.local_session), src);
            }
        }
        if self.remote.is_none() {
            info!("udp_link::handle_probe - {} reachable at {}", self.peer_id, src);
            self.remote = Some(src);
            self.state = LinkState::Open;
        }
    }
}

impl DataLink for UdpLink {
    fn link_id(&self) -> u64 {
        self.link_id
    }
    fn send(&mut self, payload: &[u8]) -> Result<(), BoxError> {
        match (&self.sock, self.remote, self.state) {
            (Some(sock), Some(remote), LinkState::Open) => {
                sock.send_to(payload, remote)?;
                Ok(())
            }
            _ => bail!("link to {} is not open", self.peer_id),
        }
    }
    fn set_remote_description(&mut self, description: &Value) -> Result<(), BoxError> {
        let session = parse_session(description)?;
        self.remote_session = Some(session);
        Ok(())
    }
    fn has_remote_description(&self) -> bool {
        self.remote_session.is_some()
    }
    fn add_remote_candidate(&mut self, candidate: &Value) -> Result<(), BoxError> {
        let addr: SocketAddr = match candidate["addr"].as_str() {
            Some(a) => a.parse()?,
            None => bail!("candidate without an address: {}", candidate),
        };
        if !self.remote_candidates.contains(&addr) {
            debug!("udp_link::add_remote_candidate - {} at {}", self.peer_id, addr);
            self.remote_candidates.push(addr);
        }
        Ok(())
    }
    fn poll(&mut self, now_ms: f64) -> Vec<LinkEvent> {
        let mut events: Vec<LinkEvent> = self
            .local_candidates
            .drain(..)
            .map(LinkEvent::LocalCandidate)
            .collect();
        if self.state == LinkState::Closed {
            return events;
        }
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let received = match &self.sock {
                Some(sock) => sock.recv_from(&mut buf),
                None => break,
            };
            match received {
                Ok((nbytes, src)) => {
                    if let Some((kind, session)) = parse_probe(&buf[..nbytes]) {
                        self.handle_probe(kind, session, src);
                    } else if self.state == LinkState::Open && self.remote == Some(src) {
                        events.push(LinkEvent::Data(buf[..nbytes].to_vec()));
                    } else {
                        debug!("udp_link::poll - {} bytes from {} dropped", nbytes, src);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                    // icmp from a candidate that isn't listening
                    debug!("udp_link::poll - {}: {}", self.peer_id, e);
                }
                Err(e) => {
                    warn!("udp_link::poll - socket error on link to {}: {}", self.peer_id, e);
                    self.close();
                    events.push(LinkEvent::Closed(e.to_string()));
                    return events;
                }
            }
        }
        if self.state == LinkState::Open && !self.open_reported {
            self.open_reported = true;
            // Open goes ahead of any data that arrived in the same poll
            events.insert(0, LinkEvent::Open);
        }
        if self.state == LinkState::Negotiating
            && self.remote_session.is_some()
            && !self.remote_candidates.is_empty()
            && self.probe_timer.expired(now_ms)
        {
            self.send_probes(now_ms);
        }
        events
    }
    fn close(&mut self) {
        if self.sock.take().is_some() {
            debug!("udp_link::close - link {} to {}", self.link_id, self.peer_id);
        }
        self.state = LinkState::Closed;
    }
}

impl fmt::Display for UdpLink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ peer: {}, state: {}, local: {:?}, remote: {:?} }}",
            self.peer_id,
            self.state,
            self.local_addr(),
            self.remote
        )
    }
}

/// makes [`UdpLink`]s
pub struct UdpTransport {
    bind_ip: IpAddr,
    advertise_ip: IpAddr,
}

impl UdpTransport {
    /// `bind_ip` is where link sockets listen, `advertise_ip` what we tell peers to use
    pub fn new(bind_ip: IpAddr, advertise_ip: IpAddr) -> UdpTransport {
        UdpTransport {
            bind_ip,
            advertise_ip,
        }
    }
    fn new_link(&self, peer_id: &str) -> Result<UdpLink, BoxError> {
        let sock = bind_socket(self.bind_ip)?;
        UdpLink::new(peer_id, sock, self.advertise_ip)
    }
}

impl LinkTransport for UdpTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }
    fn create_offer(&mut self, peer_id: &str) -> Result<(Box<dyn DataLink>, Value), BoxError> {
        let link = self.new_link(peer_id)?;
        let offer = link.description();
        Ok((Box::new(link), offer))
    }
    fn accept_offer(
        &mut self,
        peer_id: &str,
        offer: &Value,
    ) -> Result<(Box<dyn DataLink>, Value), BoxError> {
        let mut link = self.new_link(peer_id)?;
        link.set_remote_description(offer)?;
        let answer = link.description();
        Ok((Box::new(link), answer))
    }
}
