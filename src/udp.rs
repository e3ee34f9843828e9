use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use etherparse::{ip_number, Ipv4Header, Ipv6Header, UdpHeader, UdpHeaderSlice};
use nix::errno::Errno;
use nix::sys::epoll::{epoll_ctl, EpollEvent, EpollFlags, EpollOp};
use nix::sys::socket::{
    getsockopt, recv, sendto, setsockopt, socket, sockopt, AddressFamily, Ipv6MembershipRequest,
    MsgFlags, SockFlag, SockProtocol, SockType, SockaddrIn, SockaddrIn6,
};
use nix::unistd::write;
use tracing::{debug, warn};

use crate::err::Error;
use crate::host::{Direction, Redirect};
use crate::session::{Dual, Flow, Kind, Protocol, Quad, Session, SessionTable};
use crate::util::get_ms;
use crate::{
    Arguments, IPDEFTTL, UDP4_MAXMSG, UDP6_MAXMSG, UDP_KEEP_TIMEOUT, UDP_TIMEOUT_53,
    UDP_TIMEOUT_ANY,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpState {
    Active,
    Finishing,
    Closed,
}

#[derive(Debug)]
pub struct UdpSession {
    pub quad: Quad,
    /// Where datagrams actually go; differs from `quad.dst` when the
    /// DNS redirect applies.
    pub remote: Dual,
    pub state: UdpState,
    /// Largest payload a single relay operation handles.
    pub mss: u16,
    pub time: i64,
    pub sent: u64,
    pub received: u64,
}

/// The guest addresses its DNS queries at 198.18.0.1; they are served
/// by 1.1.1.1. The guest-visible quad is untouched so replies are
/// framed from the address the guest queried.
pub fn dns_redirect(dst: Dual) -> Dual {
    if dst.addr == IpAddr::V4(Ipv4Addr::new(198, 18, 0, 1)) && dst.port == 53 {
        Dual {
            addr: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            port: 53,
        }
    } else {
        dst
    }
}

pub fn get_udp_timeout(cur: &UdpSession, sessions: usize, maxsessions: usize) -> i64 {
    let timeout = if cur.quad.dst.port == 53 {
        UDP_TIMEOUT_53
    } else {
        UDP_TIMEOUT_ANY
    };
    let scale = 100 - (sessions * 100 / maxsessions) as i64;
    timeout * scale / 100
}

/// Reaper predicate; returns true when the session is to be removed.
pub fn check_udp_session(session: &mut Session, sessions: usize, maxsessions: usize) -> bool {
    let Session { socket, kind, .. } = session;
    let Kind::Udp(udp) = kind else { return false };

    let now = get_ms();

    if udp.state == UdpState::Active
        && udp.time + get_udp_timeout(udp, sessions, maxsessions) * 1000 < now
    {
        udp.state = UdpState::Finishing;
    }

    if udp.state == UdpState::Finishing {
        *socket = None;
        udp.time = get_ms();
        udp.state = UdpState::Closed;
    }

    if udp.state == UdpState::Closed && (udp.sent != 0 || udp.received != 0) {
        udp.sent = 0;
        udp.received = 0;
    }

    udp.state == UdpState::Closed && udp.time + UDP_KEEP_TIMEOUT * 1000 < now
}

/// Host-socket readiness: one recv, framed back to the guest. A DNS
/// session finishes eagerly after its first reply.
pub fn check_udp_socket(args: &Arguments, session: &mut Session, ready: EpollFlags) {
    let Session { socket, kind, .. } = session;
    let Kind::Udp(udp) = kind else { return };

    if ready.contains(EpollFlags::EPOLLERR) {
        udp.time = get_ms();
        if let Some(sock) = socket.as_ref() {
            if let Ok(serr) = getsockopt(sock.as_raw_fd(), sockopt::SocketError) {
                warn!(error = serr, "udp socket error");
            }
        }
        udp.state = UdpState::Finishing;
    } else if ready.contains(EpollFlags::EPOLLIN) {
        let Some(fd) = socket.as_ref().map(|s| s.as_raw_fd()) else {
            return;
        };

        udp.time = get_ms();

        let mut buffer = vec![0u8; udp.mss as usize];
        match recv(fd, &mut buffer, MsgFlags::empty()) {
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
            Err(err) => {
                warn!(%err, "udp recv error");
                udp.state = UdpState::Finishing;
            }
            Ok(0) => udp.state = UdpState::Finishing,
            Ok(bytes) => {
                udp.received += bytes as u64;
                if write_udp(args, udp, &buffer[..bytes]).is_err() {
                    udp.state = UdpState::Finishing;
                } else if udp.quad.dst.port == 53 {
                    udp.state = UdpState::Finishing;
                }
            }
        }
    }
}

/// Guest-to-core UDP ingress.
#[allow(clippy::too_many_arguments)]
pub fn handle_udp(
    args: &Arguments,
    table: &mut SessionTable,
    epoll_fd: RawFd,
    src: IpAddr,
    dst: IpAddr,
    udph: &UdpHeaderSlice,
    data: &[u8],
    uid: i32,
    redirect: Option<&Redirect>,
) {
    let quad = Quad {
        src: Dual {
            addr: src,
            port: udph.source_port(),
        },
        dst: Dual {
            addr: dst,
            port: udph.destination_port(),
        },
    };
    let flow = Flow {
        protocol: Protocol::Udp,
        quad,
    };

    let active = table.get_mut(&flow).map(|session| session.is_active());
    if let Some(active) = active {
        if !active {
            return;
        }
    } else {
        let remote = dns_redirect(quad.dst);

        let rversion = match redirect {
            Some(redirect) => match redirect.addr {
                IpAddr::V4(_) => 4,
                IpAddr::V6(_) => 6,
            },
            None => quad.version(),
        };

        let udp = UdpSession {
            quad,
            remote,
            state: UdpState::Active,
            mss: if rversion == 4 {
                UDP4_MAXMSG
            } else {
                UDP6_MAXMSG
            },
            time: get_ms(),
            sent: 0,
            received: 0,
        };

        let sock = match open_udp_socket(&udp, redirect) {
            Ok(sock) => sock,
            Err(err) => {
                warn!(%err, "failed to open udp socket");
                return;
            }
        };

        let token = table.alloc_token();
        let events = EpollFlags::EPOLLIN | EpollFlags::EPOLLERR;
        let mut ev = EpollEvent::new(events, token);
        if let Err(err) = epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, sock.as_raw_fd(), &mut ev) {
            warn!(%err, "failed to watch udp socket");
            return;
        }

        debug!(
            src = %quad.src.addr, sport = quad.src.port,
            dst = %quad.dst.addr, dport = quad.dst.port,
            "new udp session"
        );

        table.insert(
            flow,
            Session {
                token,
                socket: Some(sock),
                events,
                uid,
                kind: Kind::Udp(udp),
            },
        );
    }

    let session = table.get_mut(&flow).unwrap();
    let Session { socket, kind, .. } = session;
    let Kind::Udp(udp) = kind else { return };
    let Some(fd) = socket.as_ref().map(|s| s.as_raw_fd()) else {
        return;
    };

    udp.time = get_ms();

    let target = match redirect {
        Some(redirect) => Dual {
            addr: redirect.addr,
            port: redirect.port,
        },
        None => udp.remote,
    };

    let result = match target.addr {
        IpAddr::V4(v4) => sendto(
            fd,
            data,
            &SockaddrIn::from(SocketAddrV4::new(v4, target.port)),
            MsgFlags::MSG_NOSIGNAL,
        ),
        IpAddr::V6(v6) => sendto(
            fd,
            data,
            &SockaddrIn6::from(SocketAddrV6::new(v6, target.port, 0, 0)),
            MsgFlags::MSG_NOSIGNAL,
        ),
    };

    match result {
        Ok(sent) if sent == data.len() => udp.sent += sent as u64,
        Ok(_) => udp.state = UdpState::Finishing,
        Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
        Err(err) => {
            warn!(%err, "udp sendto failed");
            udp.state = UdpState::Finishing;
        }
    }
}

fn open_udp_socket(cur: &UdpSession, redirect: Option<&Redirect>) -> Result<OwnedFd, Error> {
    let addr = match redirect {
        Some(redirect) => redirect.addr,
        None => cur.remote.addr,
    };
    let family = match addr {
        IpAddr::V4(_) => AddressFamily::Inet,
        IpAddr::V6(_) => AddressFamily::Inet6,
    };

    let fd = socket(
        family,
        SockType::Datagram,
        SockFlag::SOCK_NONBLOCK,
        SockProtocol::Udp,
    )
    .map_err(Error::Socket)?;
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    match cur.remote.addr {
        IpAddr::V4(v4) if v4 == Ipv4Addr::BROADCAST => {
            setsockopt(sock.as_raw_fd(), sockopt::Broadcast, &true).map_err(Error::Socket)?;
        }
        IpAddr::V6(v6) if v6.octets()[0] == 0xFF => {
            let _ = setsockopt(
                sock.as_raw_fd(),
                sockopt::Ipv6AddMembership,
                &Ipv6MembershipRequest::new(v6),
            );
        }
        _ => {}
    }

    Ok(sock)
}

fn udp_frame(cur: &UdpSession, data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut frame = Vec::with_capacity(48 + data.len());

    match (cur.quad.src.addr, cur.quad.dst.addr) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let ip4 = Ipv4Header::new(
                8 + data.len() as u16,
                IPDEFTTL,
                ip_number::UDP,
                dst.octets(),
                src.octets(),
            );
            let udp =
                UdpHeader::with_ipv4_checksum(cur.quad.dst.port, cur.quad.src.port, &ip4, data)?;
            ip4.write(&mut frame)?;
            udp.write(&mut frame)?;
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let ip6 = Ipv6Header {
                traffic_class: 0,
                flow_label: 0,
                payload_length: 8 + data.len() as u16,
                next_header: ip_number::UDP,
                hop_limit: IPDEFTTL,
                source: dst.octets(),
                destination: src.octets(),
            };
            let udp =
                UdpHeader::with_ipv6_checksum(cur.quad.dst.port, cur.quad.src.port, &ip6, data)?;
            ip6.write(&mut frame)?;
            udp.write(&mut frame)?;
        }
        _ => unreachable!("mixed address families in one quad"),
    }

    frame.extend_from_slice(data);
    Ok(frame)
}

/// Frames one datagram toward the guest and writes it to the TUN
/// device.
pub fn write_udp(args: &Arguments, cur: &UdpSession, data: &[u8]) -> Result<(), Error> {
    let frame = udp_frame(cur, data)?;

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
