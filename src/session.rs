use std::collections::HashMap;
use std::net::IpAddr;
use std::os::fd::OwnedFd;

use nix::sys::epoll::EpollFlags;
use tracing::debug;

use crate::icmp::IcmpSession;
use crate::tcp::{TcpSession, TcpState};
use crate::udp::{UdpSession, UdpState};

/// One endpoint of a flow, as seen by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dual {
    pub addr: IpAddr,
    pub port: u16,
}

/// Guest-visible flow addressing: `src` is the guest side, `dst` the
/// remote the guest believes it is talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub src: Dual,
    pub dst: Dual,
}

impl Quad {
    pub fn version(&self) -> u8 {
        match self.src.addr {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Icmp,
    Udp,
    Tcp,
}

/// Session table key. Two live sessions never share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flow {
    pub protocol: Protocol,
    pub quad: Quad,
}

#[derive(Debug)]
pub enum Kind {
    Icmp(IcmpSession),
    Udp(UdpSession),
    Tcp(TcpSession),
}

/// Per-flow state: the common preamble plus the protocol-specific
/// attributes. The session exclusively owns its host socket.
#[derive(Debug)]
pub struct Session {
    pub token: u64,
    pub socket: Option<OwnedFd>,
    pub events: EpollFlags,
    pub uid: i32,
    pub kind: Kind,
}

impl Session {
    /// Counts toward the session budget while the flow is not in a
    /// terminal or dying state.
    pub fn is_active(&self) -> bool {
        match &self.kind {
            Kind::Icmp(icmp) => !icmp.stop,
            Kind::Udp(udp) => udp.state == UdpState::Active,
            Kind::Tcp(tcp) => tcp.state != TcpState::Closing && tcp.state != TcpState::Close,
        }
    }
}

/// Epoll token values below this are reserved for the self-pipe and
/// the TUN device.
pub const FIRST_SESSION_TOKEN: u64 = 2;

#[derive(Debug, Default)]
pub struct SessionTable {
    by_flow: HashMap<Flow, Session>,
    by_token: HashMap<u64, Flow>,
    next_token: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable {
            by_flow: HashMap::new(),
            by_token: HashMap::new(),
            next_token: FIRST_SESSION_TOKEN,
        }
    }

    pub fn alloc_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    pub fn insert(&mut self, flow: Flow, session: Session) {
        self.by_token.insert(session.token, flow);
        self.by_flow.insert(flow, session);
    }

    pub fn contains(&self, flow: &Flow) -> bool {
        self.by_flow.contains_key(flow)
    }

    pub fn get_mut(&mut self, flow: &Flow) -> Option<&mut Session> {
        self.by_flow.get_mut(flow)
    }

    pub fn flow_of_token(&self, token: u64) -> Option<Flow> {
        self.by_token.get(&token).copied()
    }

    pub fn remove(&mut self, flow: &Flow) -> Option<Session> {
        let session = self.by_flow.remove(flow)?;
        self.by_token.remove(&session.token);
        Some(session)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Flow, &mut Session)> {
        self.by_flow.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.by_flow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_flow.is_empty()
    }

    /// Number of sessions counting toward the budget.
    pub fn active(&self) -> usize {
        self.by_flow.values().filter(|s| s.is_active()).count()
    }

    /// Drops every session; host sockets and queued segments go with
    /// them.
    pub fn clear(&mut self) {
        if !self.by_flow.is_empty() {
            debug!(sessions = self.by_flow.len(), "clearing session table");
        }
        self.by_flow.clear();
        self.by_token.clear();
    }
}
