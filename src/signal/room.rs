//! websocket connection to a chat room on the signaling server
//!
//! The server speaks the primus chat room protocol: create/join a room by name, "say"
//! things to it, and everybody in the room hears them.  Signaling messages ride inside
//! the "message" field as a json string.
use log::{debug, trace};
use serde_json::{json, Value};
use std::{
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    thread::sleep,
    time::Duration,
};
use tungstenite::{
    client,
    error::{Error, UrlError},
    http::Uri,
    stream::{Mode, NoDelay},
    Message, WebSocket,
};
use url::Url;

use crate::common::box_error::BoxError;

// the server needs a moment to create a brand new room before we can join it
const ROOM_CREATE_WAIT: Duration = Duration::from_millis(500);
// read timeout on the socket so the owning thread can poll its channels
const READ_POLL: Duration = Duration::from_millis(20);

#[derive(PartialEq)]
enum RoomState {
    Idle,
    Inside,
}

pub struct Room {
    state: RoomState,
    name: String,
    sock: WebSocket<TcpStream>,
    msg_id: u64,
}

impl Room {
    pub fn new(name: &str, url: &str) -> Result<Self, BoxError> {
        let stream = Self::make_stream(url)?;
        let (sock, _resp) = client::client(Url::parse(url)?, stream)?;
        Ok(Room {
            state: RoomState::Idle,
            name: String::from(name),
            sock,
            msg_id: 0,
        })
    }
    fn make_stream(url: &str) -> Result<TcpStream, BoxError> {
        let url = Url::parse(url)?;
        let request = client::IntoClientRequest::into_client_request(url)?;
        let uri = request.uri();
        let mode = client::uri_mode(uri)?;
        let host = uri.host().ok_or(Error::Url(UrlError::NoHostName))?;
        let port = uri.port_u16().unwrap_or(match mode {
            Mode::Plain => 80,
            Mode::Tls => 443,
        });
        let addrs = (host, port).to_socket_addrs()?;
        let addrs: Vec<SocketAddr> = addrs.collect();
        let mut stream = Self::connect_to_some(&addrs, uri)?;
        NoDelay::set_nodelay(&mut stream, true)?;
        stream.set_read_timeout(Some(READ_POLL))?;
        Ok(stream)
    }
    fn connect_to_some(addrs: &[SocketAddr], uri: &Uri) -> Result<TcpStream, Error> {
        for addr in addrs {
            debug!("room::connect_to_some - trying {} at {}", uri, addr);
            if let Ok(stream) = TcpStream::connect(addr) {
                return Ok(stream);
            }
        }
        Err(Error::Url(UrlError::UnableToConnect(uri.to_string())))
    }
    fn next_id(&mut self) -> u64 {
        let id = self.msg_id;
        self.msg_id += 1;
        id
    }
    pub fn join_room(&mut self) -> Result<(), BoxError> {
        let msg = json!({
          "event": "action",
          "params": {
            "name": self.name.as_str(),
            "action": "createChatRoom",
          },
          "messageId": self.next_id(),
        });
        self.sock.write_message(Message::Text(msg.to_string()))?;
        // creating an existing room gives a harmless error, creating a new one takes a beat
        sleep(ROOM_CREATE_WAIT);
        let msg = json!({
          "event": "roomAdd",
          "room": self.name.as_str(),
          "messageId": self.next_id(),
        });
        self.sock.write_message(Message::Text(msg.to_string()))?;
        self.state = RoomState::Inside;
        Ok(())
    }
    pub fn reset(&mut self) {
        self.state = RoomState::Idle;
    }
    pub fn is_connected(&self) -> bool {
        self.state == RoomState::Inside
    }

    // the server pings with "primus::ping::<n>" and wants "primus::pong::<n>" back
    fn is_primus_ping(&mut self, msg: &Message) -> bool {
        let msg_body = msg.to_string();
        if !msg_body.contains("primus::ping::") {
            return false;
        }
        if let Some(stamp) = msg_body.split("::ping::").nth(1) {
            let _res = self
                .sock
                .write_message(Message::Text(format!("\"primus::pong::{}", stamp)));
        }
        true
    }

    /// say something to the room
    pub fn send_message(&mut self, msg: &Value) -> Result<(), BoxError> {
        let msg = json!({
            "event": "say",
            "room": self.name.as_str(),
            "message": msg.to_string(),
            "messageId": self.next_id(),
        });
        trace!("room::send_message - {}", msg);
        self.sock.write_message(Message::Text(msg.to_string()))?;
        Ok(())
    }

    /// read one user message off the room.  Returns Ok(None) on timeouts and server chatter.
    pub fn get_message(&mut self) -> Result<Option<Value>, BoxError> {
        match self.sock.read_message() {
            Ok(msg) => {
                if self.is_primus_ping(&msg) {
                    return Ok(None);
                }
                let jvalue: Value = serde_json::from_str(msg.to_string().as_str())?;
                if jvalue["context"] == "user" {
                    Ok(Some(jvalue))
                } else {
                    Ok(None)
                }
            }
            Err(Error::Io(ioerr))
                if ioerr.kind() == std::io::ErrorKind::WouldBlock
                    || ioerr.kind() == std::io::ErrorKind::TimedOut =>
            {
                // timeout reading the websocket
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
