use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use etherparse::{ip_number, Ipv4Header, Ipv6Header};
use nix::errno::Errno;
use nix::sys::epoll::{epoll_ctl, EpollEvent, EpollFlags, EpollOp};
use nix::sys::socket::{recv, sendto, MsgFlags, SockaddrIn, SockaddrIn6};
use nix::unistd::write;
use tracing::{debug, warn};

use crate::err::Error;
use crate::host::Direction;
use crate::session::{Dual, Flow, Kind, Protocol, Quad, Session, SessionTable};
use crate::util::{calc_checksum, get_ms};
use crate::{Arguments, ICMP_TIMEOUT, IPDEFTTL};

const ECHO_REQUEST_V4: u8 = 8;
const ECHO_REQUEST_V6: u8 = 128;

#[derive(Debug)]
pub struct IcmpSession {
    /// Echo identifier stands in for the ports on both sides.
    pub quad: Quad,
    pub id: u16,
    pub stop: bool,
    pub time: i64,
    pub sent: u64,
    pub received: u64,
}

pub fn get_icmp_timeout(_cur: &IcmpSession, sessions: usize, maxsessions: usize) -> i64 {
    let scale = 100 - (sessions * 100 / maxsessions) as i64;
    ICMP_TIMEOUT * scale / 100
}

/// Reaper predicate; an ICMP session is removed as soon as it stops or
/// idles out.
pub fn check_icmp_session(session: &mut Session, sessions: usize, maxsessions: usize) -> bool {
    let Session { socket, kind, .. } = session;
    let Kind::Icmp(icmp) = kind else { return false };

    let now = get_ms();
    if icmp.stop || icmp.time + get_icmp_timeout(icmp, sessions, maxsessions) * 1000 < now {
        debug!(
            sent = icmp.sent,
            received = icmp.received,
            "icmp session finished"
        );
        *socket = None;
        icmp.stop = true;
        return true;
    }

    false
}

/// Guest-to-core ICMP echo ingress. Non-echo messages are dropped.
pub fn handle_icmp(
    args: &Arguments,
    table: &mut SessionTable,
    epoll_fd: RawFd,
    src: IpAddr,
    dst: IpAddr,
    payload: &[u8],
    uid: i32,
) {
    if payload.len() < 8 {
        return;
    }

    let version = if src.is_ipv4() { 4 } else { 6 };
    let echo_request = if version == 4 {
        ECHO_REQUEST_V4
    } else {
        ECHO_REQUEST_V6
    };
    if payload[0] != echo_request {
        debug!(icmp_type = payload[0], "ignoring non-echo icmp");
        return;
    }

    let id = u16::from_be_bytes([payload[4], payload[5]]);
    let quad = Quad {
        src: Dual {
            addr: src,
            port: id,
        },
        dst: Dual {
            addr: dst,
            port: id,
        },
    };
    let flow = Flow {
        protocol: Protocol::Icmp,
        quad,
    };

    if !table.contains(&flow) {
        let sock = match open_icmp_socket(version) {
            Ok(sock) => sock,
            Err(err) => {
                warn!(%err, "failed to open icmp socket");
                return;
            }
        };

        let token = table.alloc_token();
        let events = EpollFlags::EPOLLIN | EpollFlags::EPOLLERR;
        let mut ev = EpollEvent::new(events, token);
        if let Err(err) = epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, sock.as_raw_fd(), &mut ev) {
            warn!(%err, "failed to watch icmp socket");
            return;
        }

        debug!(src = %src, dst = %dst, id, "new icmp session");

        table.insert(
            flow,
            Session {
                token,
                socket: Some(sock),
                events,
                uid,
                kind: Kind::Icmp(IcmpSession {
                    quad,
                    id,
                    stop: false,
                    time: get_ms(),
                    sent: 0,
                    received: 0,
                }),
            },
        );
    }

    let session = table.get_mut(&flow).unwrap();
    let Session { socket, kind, .. } = session;
    let Kind::Icmp(icmp) = kind else { return };
    let Some(fd) = socket.as_ref().map(|s| s.as_raw_fd()) else {
        return;
    };

    icmp.time = get_ms();

    let result = match dst {
        IpAddr::V4(v4) => sendto(
            fd,
            payload,
            &SockaddrIn::from(SocketAddrV4::new(v4, 0)),
            MsgFlags::MSG_NOSIGNAL,
        ),
        IpAddr::V6(v6) => sendto(
            fd,
            payload,
            &SockaddrIn6::from(SocketAddrV6::new(v6, 0, 0, 0)),
            MsgFlags::MSG_NOSIGNAL,
        ),
    };

    match result {
        Ok(sent) => icmp.sent += sent as u64,
        Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
        Err(err) => {
            warn!(%err, "icmp sendto failed");
            icmp.stop = true;
        }
    }
}

/// Host-socket readiness: one reply, identifier restored, framed back
/// to the guest.
pub fn check_icmp_socket(args: &Arguments, session: &mut Session, ready: EpollFlags) {
    let Session { socket, kind, .. } = session;
    let Kind::Icmp(icmp) = kind else { return };

    if ready.contains(EpollFlags::EPOLLERR) {
        icmp.stop = true;
        return;
    }
    if !ready.contains(EpollFlags::EPOLLIN) {
        return;
    }
    let Some(fd) = socket.as_ref().map(|s| s.as_raw_fd()) else {
        return;
    };

    icmp.time = get_ms();

    let mut buffer = vec![0u8; 65536];
    match recv(fd, &mut buffer, MsgFlags::empty()) {
        Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
        Err(err) => {
            warn!(%err, "icmp recv error");
            icmp.stop = true;
        }
        Ok(0) => icmp.stop = true,
        Ok(bytes) => {
            icmp.received += bytes as u64;

            let mut message = buffer[..bytes].to_vec();
            patch_echo_id(&mut message, icmp.id);
            if write_icmp(args, icmp, &mut message).is_err() {
                icmp.stop = true;
            }
        }
    }
}

/// The kernel rewrites the echo identifier of a datagram ICMP socket;
/// restore the one the guest chose.
fn patch_echo_id(message: &mut [u8], id: u16) {
    if message.len() >= 8 {
        message[4..6].copy_from_slice(&id.to_be_bytes());
    }
}

fn open_icmp_socket(version: u8) -> Result<OwnedFd, Error> {
    // nix 0.26 has no SockProtocol variant for datagram ICMP sockets.
    let (family, protocol) = if version == 4 {
        (libc::AF_INET, libc::IPPROTO_ICMP)
    } else {
        (libc::AF_INET6, libc::IPPROTO_ICMPV6)
    };

    let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM | libc::SOCK_NONBLOCK, protocol) };
    if fd < 0 {
        return Err(Error::Socket(Errno::last()));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Frames one ICMP message toward the guest, recomputing the message
/// checksum after the identifier patch.
fn write_icmp(args: &Arguments, cur: &IcmpSession, message: &mut [u8]) -> Result<(), Error> {
    let mut frame = Vec::with_capacity(40 + message.len());

    match (cur.quad.src.addr, cur.quad.dst.addr) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            message[2..4].copy_from_slice(&[0, 0]);
            let sum = !calc_checksum(0, message);
            message[2..4].copy_from_slice(&sum.to_be_bytes());

            let ip4 = Ipv4Header::new(
                message.len() as u16,
                IPDEFTTL,
                ip_number::ICMP,
                dst.octets(),
                src.octets(),
            );
            ip4.write(&mut frame)?;
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            // ICMPv6 checksums over the v6 pseudo header.
            message[2..4].copy_from_slice(&[0, 0]);
            let mut pseudo = [0u8; 40];
            pseudo[..16].copy_from_slice(&dst.octets());
            pseudo[16..32].copy_from_slice(&src.octets());
            pseudo[32..36].copy_from_slice(&(message.len() as u32).to_be_bytes());
            pseudo[39] = ip_number::IPV6_ICMP;
            let sum = !calc_checksum(calc_checksum(0, &pseudo), message);
            message[2..4].copy_from_slice(&sum.to_be_bytes());

            let ip6 = Ipv6Header {
                traffic_class: 0,
                flow_label: 0,
                payload_length: message.len() as u16,
                next_header: ip_number::IPV6_ICMP,
                hop_limit: IPDEFTTL,
                source: dst.octets(),
                destination: src.octets(),
            };
            ip6.write(&mut frame)?;
        }
        _ => unreachable!("mixed address families in one quad"),
    }

    frame.extend_from_slice(message);

    args.monitor.on_packet(&frame, Direction::Outbound);

    let written = write(args.tun, &frame).map_err(Error::Tun)?;
    if written != frame.len() {
        return Err(Error::ShortWrite {
            written,
            length: frame.len(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::checksum_valid;

    #[test]
    fn echo_id_is_restored() {
        let mut message = [0u8; 16];
        message[0] = 0; // echo reply
        message[4..6].copy_from_slice(&0xBEEF_u16.to_be_bytes());

        patch_echo_id(&mut message, 0x1234);
        assert_eq!(&message[4..6], &0x1234_u16.to_be_bytes());
    }

    #[test]
    fn reply_checksum_covers_patched_message() {
        let mut message = vec![0u8; 12];
        message[0] = 0; // echo reply
        message[4..6].copy_from_slice(&0x1234_u16.to_be_bytes());
        message[8..12].copy_from_slice(b"ping");

        // Same arithmetic write_icmp applies for IPv4.
        message[2..4].copy_from_slice(&[0, 0]);
        let sum = !calc_checksum(0, &message);
        message[2..4].copy_from_slice(&sum.to_be_bytes());

        assert!(checksum_valid(&message));
    }
}
