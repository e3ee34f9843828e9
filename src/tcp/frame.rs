use std::net::IpAddr;

use etherparse::{ip_number, Ipv4Header, Ipv6Header, TcpHeader, TcpOptionElement};
use nix::unistd::write;

use crate::err::Error;
use crate::host::Direction;
use crate::tcp::TcpSession;
use crate::util::get_default_mss;
use crate::{Arguments, IPDEFTTL};

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl TcpFlags {
    pub const SYN_ACK: TcpFlags = TcpFlags {
        syn: true,
        ack: true,
        fin: false,
        rst: false,
        psh: false,
    };
    pub const ACK: TcpFlags = TcpFlags {
        syn: false,
        ack: true,
        fin: false,
        rst: false,
        psh: false,
    };
    pub const FIN_ACK: TcpFlags = TcpFlags {
        syn: false,
        ack: true,
        fin: true,
        rst: false,
        psh: false,
    };
    pub const PSH_ACK: TcpFlags = TcpFlags {
        syn: false,
        ack: true,
        fin: false,
        rst: false,
        psh: true,
    };
}

/// Builds one IP/TCP datagram toward the guest.
///
/// Addresses and ports are swapped relative to the session quad: this
/// endpoint speaks as the guest's remote peer. Options are appended on
/// SYN-bearing segments only.
pub fn tcp_frame(cur: &TcpSession, flags: TcpFlags, payload: &[u8]) -> Result<Vec<u8>, Error> {
    let mut tcp = TcpHeader::new(
        cur.quad.dst.port,
        cur.quad.src.port,
        cur.local_seq,
        (cur.recv_window >> cur.recv_scale).min(0xFFFF) as u16,
    );
    tcp.syn = flags.syn;
    tcp.ack = flags.ack;
    tcp.fin = flags.fin;
    tcp.rst = flags.rst;
    tcp.psh = flags.psh;
    if flags.ack {
        tcp.acknowledgment_number = cur.remote_seq;
    }

    if flags.syn {
        tcp.set_options(&[
            TcpOptionElement::MaximumSegmentSize(get_default_mss(cur.quad.version())),
            TcpOptionElement::WindowScale(cur.recv_scale),
        ])
        .map_err(|_| Error::TcpOptions)?;
    }

    let mut frame = Vec::with_capacity(40 + tcp.header_len() as usize + payload.len());

    match (cur.quad.src.addr, cur.quad.dst.addr) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let ip4 = Ipv4Header::new(
                tcp.header_len() + payload.len() as u16,
                IPDEFTTL,
                ip_number::TCP,
                dst.octets(),
                src.octets(),
            );
            tcp.checksum = tcp.calc_checksum_ipv4(&ip4, payload)?;
            ip4.write(&mut frame)?;
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let ip6 = Ipv6Header {
                traffic_class: 0,
                flow_label: 0,
                payload_length: tcp.header_len() + payload.len() as u16,
                next_header: ip_number::TCP,
                hop_limit: IPDEFTTL,
                source: dst.octets(),
                destination: src.octets(),
            };
            tcp.checksum = tcp.calc_checksum_ipv6(&ip6, payload)?;
            ip6.write(&mut frame)?;
        }
        _ => unreachable!("mixed address families in one quad"),
    }

    tcp.write(&mut frame)?;
    frame.extend_from_slice(payload);

    Ok(frame)
}

/// Frames and writes one segment to the TUN device. A short write is an
/// error; the caller transitions the session toward CLOSING.
pub fn write_tcp(
    args: &Arguments,
    cur: &TcpSession,
    flags: TcpFlags,
    payload: &[u8],
) -> Result<(), Error> {
    let frame = tcp_frame(cur, flags, payload)?;

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
