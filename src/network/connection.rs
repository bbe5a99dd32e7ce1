//! Per-socket connection state and core-loop events.

use std::net::{IpAddr, SocketAddr};

use modircd_proto::{Frame, Message};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

pub type ConnId = u64;

/// Which kind of entity owns a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionKind {
    Unregistered,
    User(Uuid),
    Server(String),
    Service(String),
}

/// Per-socket state. Wire I/O happens on dedicated tasks; the core holds
/// the outbound sender and all protocol state.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub kind: ConnectionKind,
    pub ip: IpAddr,
    pub secure: bool,
    /// True when accepted on a server-listener port.
    pub server_port: bool,
    pub pending_pass: Option<String>,
    pub pending_nick: Option<String>,
    /// `(ident, gecos)` from USER, pending registration.
    pub pending_user: Option<(String, String)>,
    /// Bytes received since the data checker last ran.
    pub bytes_in_window: u64,
    pub accepted_at: i64,
    pub last_message_at: i64,
    pub last_data_check: i64,
    pub next_ping_at: i64,
    pub outbound: UnboundedSender<Message>,
}

impl Connection {
    pub fn send(&self, msg: &Message) {
        // A closed peer task just means the Closed event is in flight.
        let _ = self.outbound.send(msg.clone());
    }
}

/// Which listener accepted a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Client,
    Server,
}

/// Events consumed by the single core task. Everything that mutates the
/// entity graph arrives here.
pub enum Event {
    Accept {
        stream: TcpStream,
        addr: SocketAddr,
        listener: ListenerKind,
        secure: bool,
    },
    Frame {
        conn: ConnId,
        frame: Frame,
    },
    Closed {
        conn: ConnId,
    },
    Tick,
    Rehash,
    Shutdown,
}
