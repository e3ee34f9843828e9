//! Helpers shared by the in-module tests: an AF_UNIX datagram
//! socketpair standing in for the TUN device, and a guest-side TCP
//! packet builder.

use std::net::Ipv4Addr;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use etherparse::{ip_number, Ipv4Header, TcpHeader, TcpOptionElement};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::read;

use crate::util::{get_ms, is_readable};

/// (host side, core side) of a datagram pair that preserves packet
/// boundaries like a TUN device does.
pub fn tun_pair() -> (OwnedFd, OwnedFd) {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::empty(),
    )
    .unwrap();
    unsafe { (OwnedFd::from_raw_fd(a), OwnedFd::from_raw_fd(b)) }
}

pub fn wait_readable(fd: RawFd) {
    for _ in 0..200 {
        if is_readable(fd) {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("fd never became readable");
}

/// Reads one datagram, waiting up to `timeout_ms` for it.
pub fn read_frame(fd: RawFd, timeout_ms: i64) -> Option<Vec<u8>> {
    let deadline = get_ms() + timeout_ms;
    while get_ms() < deadline {
        if is_readable(fd) {
            let mut buffer = vec![0u8; 65536];
            let length = read(fd, &mut buffer).ok()?;
            buffer.truncate(length);
            return Some(buffer);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    None
}

/// One IPv4/TCP packet as the guest would send it into the TUN.
pub struct GuestTcp {
    pub src: Ipv4Addr,
    pub sport: u16,
    pub dst: Ipv4Addr,
    pub dport: u16,
    pub seq: u32,
    pub ack: Option<u32>,
    pub window: u16,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub mss: Option<u16>,
    pub ws: Option<u8>,
    pub payload: Vec<u8>,
}

impl GuestTcp {
    pub fn build(&self) -> Vec<u8> {
        let mut tcp = TcpHeader::new(self.sport, self.dport, self.seq, self.window);
        tcp.syn = self.syn;
        tcp.fin = self.fin;
        tcp.rst = self.rst;
        if let Some(ack) = self.ack {
            tcp.ack = true;
            tcp.acknowledgment_number = ack;
        }
        if !self.payload.is_empty() {
            tcp.psh = true;
        }

        let mut options = Vec::new();
        if let Some(mss) = self.mss {
            options.push(TcpOptionElement::MaximumSegmentSize(mss));
        }
        if let Some(ws) = self.ws {
            options.push(TcpOptionElement::WindowScale(ws));
        }
        if !options.is_empty() {
            tcp.set_options(&options).unwrap();
        }

        let ip4 = Ipv4Header::new(
            tcp.header_len() + self.payload.len() as u16,
            64,
            ip_number::TCP,
            self.src.octets(),
            self.dst.octets(),
        );
        tcp.checksum = tcp.calc_checksum_ipv4(&ip4, &self.payload).unwrap();

        let mut packet = Vec::new();
        ip4.write(&mut packet).unwrap();
        tcp.write(&mut packet).unwrap();
        packet.extend_from_slice(&self.payload);
        packet
    }
}
