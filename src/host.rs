use std::net::IpAddr;

/// Which side of the TUN a packet was seen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Guest to core, read from the TUN device.
    Inbound,
    /// Core to guest, about to be written to the TUN device.
    Outbound,
}

/// Replacement destination returned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirect {
    pub addr: IpAddr,
    pub port: u16,
}

/// Classifier decision for one admitted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub allow: bool,
    pub uid: i32,
    pub redirect: Option<Redirect>,
}

impl Verdict {
    pub fn allow() -> Self {
        Verdict {
            allow: true,
            uid: -1,
            redirect: None,
        }
    }

    pub fn deny() -> Self {
        Verdict {
            allow: false,
            uid: -1,
            redirect: None,
        }
    }
}

/// Host-side callbacks the core consumes.
///
/// Packet slices are borrowed for the duration of the call only; the
/// backing memory is reused as soon as the callback returns.
pub trait Monitor {
    /// Admit, deny or redirect a flow-creating packet. May be
    /// side-effectful (telemetry); the core reads only the returned
    /// verdict.
    fn classify(&self, packet: &[u8], direction: Direction) -> Verdict;

    /// Optional sniff hook, invoked for every packet crossing the TUN.
    fn on_packet(&self, _packet: &[u8], _direction: Direction) {}
}

/// Admits everything. Useful as a default and in tests.
pub struct AllowAll;

impl Monitor for AllowAll {
    fn classify(&self, _packet: &[u8], _direction: Direction) -> Verdict {
        Verdict::allow()
    }
}
