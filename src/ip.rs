use std::net::IpAddr;
use std::os::fd::RawFd;

use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};
use nix::errno::Errno;
use nix::sys::epoll::EpollFlags;
use nix::unistd::read;
use tracing::{debug, enabled, warn, Level};

use crate::err::Error;
use crate::host::Direction;
use crate::session::{Dual, Flow, Protocol, Quad, SessionTable};
use crate::util::{checksum_valid, get_mtu, is_readable};
use crate::{icmp, tcp, udp, Arguments, TUN_YIELD};

/// Drains up to `TUN_YIELD` datagrams from the TUN device while it
/// stays readable. An error return is loop-fatal.
pub fn check_tun(
    args: &Arguments,
    table: &mut SessionTable,
    epoll_fd: RawFd,
    events: EpollFlags,
    sessions: usize,
    maxsessions: usize,
) -> Result<(), Error> {
    if events.contains(EpollFlags::EPOLLERR) {
        return Err(Error::Tun(Errno::EIO));
    }
    if !events.contains(EpollFlags::EPOLLIN) {
        return Ok(());
    }

    let mut buffer = vec![0u8; get_mtu() as usize];
    let mut count = 0;
    while count < TUN_YIELD && !args.ctx.is_stopping() && is_readable(args.tun) {
        count += 1;
        match read(args.tun, &mut buffer) {
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Ok(()),
            Err(err) => return Err(Error::Tun(err)),
            Ok(0) => return Err(Error::Tun(Errno::EIO)),
            Ok(length) => {
                handle_ip(
                    args,
                    table,
                    epoll_fd,
                    &buffer[..length],
                    sessions,
                    maxsessions,
                );
            }
        }
    }

    Ok(())
}

#[derive(Debug)]
pub struct Dissected<'a> {
    pub version: u8,
    pub protocol: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub payload: &'a [u8],
}

fn is_lower_layer(protocol: u8) -> bool {
    // hop-by-hop, destination, routing, fragment, AH, ESP, mobility
    matches!(protocol, 0 | 60 | 43 | 44 | 51 | 50 | 135)
}

fn is_upper_layer(protocol: u8) -> bool {
    matches!(protocol, 6 | 17 | 1 | 58)
}

/// Splits one raw datagram into addresses, upper-layer protocol and
/// payload. Fragmented IPv4, length mismatches and runts are rejected.
pub fn dissect(pkt: &[u8], verify_checksum: bool) -> Option<Dissected<'_>> {
    let version = pkt.first()? >> 4;

    if version == 4 {
        let ip4 = Ipv4HeaderSlice::from_slice(pkt).ok()?;

        if ip4.more_fragments() {
            debug!("dropping fragmented packet");
            return None;
        }
        if ip4.total_len() as usize != pkt.len() {
            debug!(
                total_len = ip4.total_len(),
                length = pkt.len(),
                "dropping packet with length mismatch"
            );
            return None;
        }

        let header_len = ip4.ihl() as usize * 4;
        if verify_checksum && !checksum_valid(&pkt[..header_len]) {
            debug!("dropping packet with invalid header checksum");
            return None;
        }

        Some(Dissected {
            version,
            protocol: ip4.protocol(),
            src: IpAddr::V4(ip4.source_addr()),
            dst: IpAddr::V4(ip4.destination_addr()),
            payload: &pkt[header_len..],
        })
    } else if version == 6 {
        let ip6 = Ipv6HeaderSlice::from_slice(pkt).ok()?;

        let mut protocol = ip6.next_header();
        let mut payload_off = 40usize;

        if !is_upper_layer(protocol) {
            let mut current = protocol;
            let mut off = 40usize;
            while is_lower_layer(current) {
                if pkt.len() < off + 8 {
                    break;
                }
                let next = pkt[off];
                off += 8 + pkt[off + 1] as usize * 8;
                current = next;
                if is_upper_layer(current) {
                    break;
                }
            }

            if is_upper_layer(current) && off <= pkt.len() {
                protocol = current;
                payload_off = off;
            }
            // Otherwise fall back to the immediate next header; the
            // protocol switch below rejects what it cannot carry.
        }

        Some(Dissected {
            version,
            protocol,
            src: IpAddr::V6(ip6.source_addr()),
            dst: IpAddr::V6(ip6.destination_addr()),
            payload: pkt.get(payload_off..)?,
        })
    } else {
        None
    }
}

fn has_udp_session(args: &Arguments, table: &SessionTable, quad: Quad) -> bool {
    if quad.dst.port == 53 && !args.fwd53 {
        return true;
    }

    table.contains(&Flow {
        protocol: Protocol::Udp,
        quad,
    })
}

/// One raw datagram from the TUN device: parse, admit, classify,
/// dispatch.
pub fn handle_ip(
    args: &Arguments,
    table: &mut SessionTable,
    epoll_fd: RawFd,
    pkt: &[u8],
    sessions: usize,
    maxsessions: usize,
) {
    let Some(dissected) = dissect(pkt, enabled!(Level::DEBUG)) else {
        return;
    };

    // Upper-layer bounds checks before anything else looks at the
    // payload.
    enum Transport<'a> {
        Icmp,
        Udp(UdpHeaderSlice<'a>),
        Tcp(TcpHeaderSlice<'a>),
    }

    let transport = match dissected.protocol {
        1 | 58 => {
            if dissected.payload.len() < 8 {
                return;
            }
            Transport::Icmp
        }
        17 => match UdpHeaderSlice::from_slice(dissected.payload) {
            Ok(udph) => Transport::Udp(udph),
            Err(_) => return,
        },
        6 => match TcpHeaderSlice::from_slice(dissected.payload) {
            Ok(tcph) => Transport::Tcp(tcph),
            Err(_) => return,
        },
        _ => return,
    };

    // Admission control: at the budget only existing flows proceed.
    if sessions >= maxsessions {
        let reject = match &transport {
            Transport::Icmp => true,
            Transport::Udp(udph) => {
                let quad = Quad {
                    src: Dual {
                        addr: dissected.src,
                        port: udph.source_port(),
                    },
                    dst: Dual {
                        addr: dissected.dst,
                        port: udph.destination_port(),
                    },
                };
                !has_udp_session(args, table, quad)
            }
            Transport::Tcp(tcph) => tcph.syn(),
        };

        if reject {
            warn!(sessions, maxsessions, "session budget reached");
            return;
        }
    }

    args.monitor.on_packet(pkt, Direction::Inbound);
    let verdict = args.monitor.classify(pkt, Direction::Inbound);

    match transport {
        Transport::Icmp => {
            if verdict.allow {
                icmp::handle_icmp(
                    args,
                    table,
                    epoll_fd,
                    dissected.src,
                    dissected.dst,
                    dissected.payload,
                    verdict.uid,
                );
            }
        }
        Transport::Udp(udph) => {
            if verdict.allow {
                udp::handle_udp(
                    args,
                    table,
                    epoll_fd,
                    dissected.src,
                    dissected.dst,
                    &udph,
                    &dissected.payload[8..],
                    verdict.uid,
                    verdict.redirect.as_ref(),
                );
            }
        }
        Transport::Tcp(tcph) => {
            let data = &dissected.payload[tcph.data_offset() as usize * 4..];
            tcp::handle_tcp(
                args,
                table,
                epoll_fd,
                dissected.src,
                dissected.dst,
                &tcph,
                data,
                verdict.uid,
                verdict.allow,
                verdict.redirect.as_ref(),
            );
        }
    }
}
