use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use etherparse::{TcpHeaderSlice, TcpOptionElement};
use nix::errno::Errno;
use nix::sys::epoll::{epoll_ctl, EpollEvent, EpollFlags, EpollOp};
use nix::sys::socket::{
    connect, getsockopt, recv, send, setsockopt, socket, sockopt, AddressFamily, MsgFlags,
    SockFlag, SockProtocol, SockaddrIn, SockaddrIn6,
};
use tracing::{debug, warn};

pub mod frame;
pub mod segment;
pub mod socks5;

use crate::err::Error;
use crate::host::Redirect;
use crate::session::{Dual, Flow, Kind, Protocol, Quad, Session, SessionTable};
use crate::util::{compare_u32, get_default_mss, get_ms};
use crate::{
    Arguments, EPOLL_MIN_CHECK, SEND_BUF_DEFAULT, TCP_CLOSE_TIMEOUT, TCP_IDLE_TIMEOUT,
    TCP_INIT_TIMEOUT, TCP_KEEP_TIMEOUT,
};
use frame::{write_tcp, TcpFlags};
use segment::ForwardQueue;
pub use socks5::Socks5State;

nix::ioctl_read_bad!(siocoutq, libc::TIOCOUTQ, libc::c_int);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynRecv,
    Established,
    CloseWait,
    FinWait1,
    LastAck,
    Closing,
    Close,
}

#[derive(Debug)]
pub struct TcpSession {
    pub quad: Quad,
    pub state: TcpState,
    pub socks5: Socks5State,

    /// Next byte this endpoint will send to the guest.
    pub local_seq: u32,
    pub local_start: u32,
    /// Next contiguous byte expected from the guest; advances only when
    /// a forward-queue segment is fully drained into the host socket.
    pub remote_seq: u32,
    pub remote_start: u32,
    /// Highest acknowledgment seen from the guest.
    pub acked: u32,

    pub send_window: u32,
    pub recv_window: u32,
    pub mss: u16,
    pub recv_scale: u8,
    pub send_scale: u8,

    pub time: i64,
    pub last_keep_alive: i64,
    /// Outgoing data segments since the last ACK from the guest.
    pub unconfirmed: u32,
    pub sent: u64,
    pub received: u64,

    pub forward: ForwardQueue,
}

impl TcpSession {
    /// Throwaway endpoint state for a stateless reset toward the guest.
    fn stateless(quad: Quad, local_seq: u32, remote_seq: u32) -> Self {
        TcpSession {
            quad,
            state: TcpState::Close,
            socks5: Socks5State::None,
            local_seq,
            local_start: local_seq,
            remote_seq,
            remote_start: remote_seq,
            acked: 0,
            send_window: 0,
            recv_window: 0,
            mss: 0,
            recv_scale: 0,
            send_scale: 0,
            time: 0,
            last_keep_alive: 0,
            unconfirmed: 0,
            sent: 0,
            received: 0,
            forward: ForwardQueue::new(),
        }
    }
}

pub fn get_tcp_timeout(cur: &TcpSession, sessions: usize, maxsessions: usize) -> i64 {
    let timeout = match cur.state {
        TcpState::Listen | TcpState::SynRecv => TCP_INIT_TIMEOUT,
        TcpState::Established => TCP_IDLE_TIMEOUT,
        _ => TCP_CLOSE_TIMEOUT,
    };

    let scale = 100 - (sessions * 100 / maxsessions) as i64;
    timeout * scale / 100
}

/// Reaper predicate; returns true when the session is to be removed.
pub fn check_tcp_session(
    args: &Arguments,
    session: &mut Session,
    sessions: usize,
    maxsessions: usize,
) -> bool {
    let Session { socket, kind, .. } = session;
    let Kind::Tcp(tcp) = kind else { return false };

    let now = get_ms();
    let timeout = get_tcp_timeout(tcp, sessions, maxsessions);

    if tcp.state != TcpState::Closing
        && tcp.state != TcpState::Close
        && tcp.time + timeout * 1000 < now
    {
        if tcp.state == TcpState::Listen {
            tcp.state = TcpState::Closing;
        } else {
            warn!(
                state = ?tcp.state,
                local = tcp.local_seq.wrapping_sub(tcp.local_start),
                remote = tcp.remote_seq.wrapping_sub(tcp.remote_start),
                "tcp session timed out"
            );
            write_rst(args, tcp);
        }
    }

    if tcp.state == TcpState::Closing {
        *socket = None;
        tcp.time = get_ms();
        tcp.state = TcpState::Close;
    }

    if (tcp.state == TcpState::Closing || tcp.state == TcpState::Close)
        && (tcp.sent != 0 || tcp.received != 0)
    {
        tcp.sent = 0;
        tcp.received = 0;
    }

    tcp.state == TcpState::Close && tcp.time + TCP_KEEP_TIMEOUT * 1000 < now
}

/// Recomputes the epoll subscription of one session. Returns true when
/// the session needs rechecking before the regular timeout.
pub fn monitor_tcp_session(args: &Arguments, session: &mut Session, epoll_fd: RawFd) -> bool {
    let Session {
        socket,
        kind,
        token,
        events,
        ..
    } = session;
    let Kind::Tcp(tcp) = kind else { return false };
    let Some(fd) = socket.as_ref().map(|s| s.as_raw_fd()) else {
        return false;
    };

    let mut recheck = false;
    let mut want = EpollFlags::EPOLLERR;

    if tcp.state == TcpState::Listen {
        if tcp.socks5 == Socks5State::None {
            want |= EpollFlags::EPOLLOUT;
        } else {
            want |= EpollFlags::EPOLLIN;
        }
    } else if tcp.state == TcpState::Established || tcp.state == TcpState::CloseWait {
        if get_send_window(tcp) > 0 {
            want |= EpollFlags::EPOLLIN;
        } else {
            recheck = true;
            /*
            RFC 1122 - 4.2.3.6: an ACK for an already-acknowledged
            sequence number is answered with the current window, so one
            probe per check interval is enough to learn when the guest
            opens up again.
            */
            let ms = get_ms();
            if ms - tcp.last_keep_alive > EPOLL_MIN_CHECK {
                tcp.last_keep_alive = ms;
                tcp.remote_seq = tcp.remote_seq.wrapping_sub(1);
                write_ack(args, tcp);
                tcp.remote_seq = tcp.remote_seq.wrapping_add(1);
            }
        }

        if let Some(head) = tcp.forward.head() {
            if head.seq == tcp.remote_seq && (head.remaining() as u32) < get_receive_buffer(socket)
            {
                want |= EpollFlags::EPOLLOUT;
            } else {
                recheck = true;
            }
        }
    }

    if want != *events {
        *events = want;
        let mut ev = EpollEvent::new(want, *token);
        if epoll_ctl(epoll_fd, EpollOp::EpollCtlMod, fd, &mut ev).is_err() {
            tcp.state = TcpState::Closing;
        }
    }

    recheck
}

/// Additional bytes this endpoint may emit toward the guest: the
/// guest-advertised window minus in-flight bytes, with header headroom
/// per unacknowledged segment.
pub fn get_send_window(cur: &TcpSession) -> u32 {
    let mut behind = if cur.acked <= cur.local_seq {
        cur.local_seq - cur.acked
    } else {
        0x10000u32
            .wrapping_add(cur.local_seq)
            .wrapping_sub(cur.acked)
    };
    behind = behind.wrapping_add((cur.unconfirmed + 1) * 40);

    if behind < cur.send_window {
        cur.send_window - behind
    } else {
        0
    }
}

/// Headroom of the host socket's send buffer.
pub fn get_receive_buffer(socket: &Option<OwnedFd>) -> u32 {
    let Some(sock) = socket else { return 0 };
    let fd = sock.as_raw_fd();

    let sendbuf = match getsockopt(fd, sockopt::SndBuf) {
        Ok(0) => SEND_BUF_DEFAULT,
        Ok(n) => n,
        Err(_) => return 0,
    };

    let mut unsent: libc::c_int = 0;
    if unsafe { siocoutq(fd, &mut unsent) }.is_err() {
        return 0;
    }
    let unsent = unsent.max(0) as usize;

    if unsent < sendbuf {
        (sendbuf - unsent) as u32
    } else {
        0
    }
}

/// Window advertised back to the guest: send-buffer headroom minus
/// bytes still queued, clamped to what the scale can express.
pub fn get_receive_window(socket: &Option<OwnedFd>, cur: &TcpSession) -> u32 {
    let toforward = cur.forward.pending_bytes();

    let mut window = get_receive_buffer(socket);
    let max = 0xFFFFu32 << cur.recv_scale;
    if window > max {
        window = max;
    }

    if toforward < window {
        window - toforward
    } else {
        0
    }
}

fn write_ack(args: &Arguments, cur: &mut TcpSession) -> bool {
    if let Err(err) = write_tcp(args, cur, TcpFlags::ACK, &[]) {
        warn!(%err, "failed to write ACK");
        cur.state = TcpState::Closing;
        return false;
    }
    true
}

fn write_syn_ack(args: &Arguments, cur: &mut TcpSession) -> bool {
    if let Err(err) = write_tcp(args, cur, TcpFlags::SYN_ACK, &[]) {
        warn!(%err, "failed to write SYN/ACK");
        cur.state = TcpState::Closing;
        return false;
    }
    true
}

fn write_fin_ack(args: &Arguments, cur: &mut TcpSession) -> bool {
    if let Err(err) = write_tcp(args, cur, TcpFlags::FIN_ACK, &[]) {
        warn!(%err, "failed to write FIN/ACK");
        cur.state = TcpState::Closing;
        return false;
    }
    true
}

fn write_data(args: &Arguments, cur: &mut TcpSession, data: &[u8]) -> bool {
    if let Err(err) = write_tcp(args, cur, TcpFlags::PSH_ACK, data) {
        warn!(%err, "failed to forward data to guest");
        cur.state = TcpState::Closing;
        return false;
    }
    true
}

pub fn write_rst(args: &Arguments, cur: &mut TcpSession) {
    let mut flags = TcpFlags {
        rst: true,
        ..Default::default()
    };

    // A reset out of LISTEN acknowledges the SYN it refuses.
    if cur.state == TcpState::Listen {
        flags.ack = true;
        cur.remote_seq = cur.remote_seq.wrapping_add(1);
    }

    if let Err(err) = write_tcp(args, cur, flags, &[]) {
        debug!(%err, "failed to write RST");
    }

    if cur.state != TcpState::Close {
        cur.state = TcpState::Closing;
    }
}

/// Guest-to-core TCP ingress.
#[allow(clippy::too_many_arguments)]
pub fn handle_tcp(
    args: &Arguments,
    table: &mut SessionTable,
    epoll_fd: RawFd,
    src: IpAddr,
    dst: IpAddr,
    tcph: &TcpHeaderSlice,
    data: &[u8],
    uid: i32,
    allowed: bool,
    redirect: Option<&Redirect>,
) {
    let quad = Quad {
        src: Dual {
            addr: src,
            port: tcph.source_port(),
        },
        dst: Dual {
            addr: dst,
            port: tcph.destination_port(),
        },
    };
    let flow = Flow {
        protocol: Protocol::Tcp,
        quad,
    };

    if tcph.urg() {
        return;
    }

    if !table.contains(&flow) {
        if tcph.syn() {
            handle_syn(args, table, epoll_fd, flow, tcph, data, uid, allowed, redirect);
        } else {
            // No session: refuse statelessly.
            let local_seq = if tcph.ack() {
                tcph.acknowledgment_number()
            } else {
                0
            };
            let remote_seq = tcph
                .sequence_number()
                .wrapping_add(data.len() as u32)
                .wrapping_add((tcph.syn() || tcph.fin()) as u32);

            let rst = TcpSession::stateless(quad, local_seq, remote_seq);
            let _ = write_tcp(
                args,
                &rst,
                TcpFlags {
                    rst: true,
                    ack: true,
                    ..Default::default()
                },
                &[],
            );
        }
        return;
    }

    let session = table.get_mut(&flow).unwrap();
    let Session { socket, kind, .. } = session;
    let Kind::Tcp(tcp) = kind else { return };

    if tcp.state == TcpState::Closing || tcp.state == TcpState::Close {
        write_rst(args, tcp);
        return;
    }

    // A retransmitted SYN does not refresh liveness.
    if !tcph.syn() {
        tcp.time = get_ms();
    }
    tcp.send_window = (tcph.window_size() as u32) << tcp.send_scale;
    tcp.unconfirmed = 0;

    if !data.is_empty() {
        if socket.is_none() || tcp.state == TcpState::CloseWait {
            write_rst(args, tcp);
            return;
        }
        tcp.forward
            .enqueue(tcph.sequence_number(), tcph.psh(), data, tcp.remote_seq);
    }

    if tcph.rst() {
        tcp.state = TcpState::Closing;
        return;
    }

    if !tcph.ack() || tcph.acknowledgment_number() == tcp.local_seq {
        if tcph.syn() {
            debug!("repeated SYN");
        } else if tcph.fin() {
            match tcp.state {
                TcpState::Established => {
                    if tcp.forward.is_empty() {
                        tcp.remote_seq = tcp.remote_seq.wrapping_add(1);
                        if write_ack(args, tcp) {
                            tcp.state = TcpState::CloseWait;
                        }
                    } else {
                        // ACK follows once the queue drains.
                        tcp.state = TcpState::CloseWait;
                    }
                }
                TcpState::CloseWait => {}
                TcpState::FinWait1 => {
                    tcp.remote_seq = tcp.remote_seq.wrapping_add(1);
                    if write_ack(args, tcp) {
                        tcp.state = TcpState::Close;
                    }
                }
                _ => {
                    debug!(state = ?tcp.state, "unexpected FIN");
                }
            }
        } else if tcph.ack() {
            tcp.acked = tcph.acknowledgment_number();

            match tcp.state {
                TcpState::SynRecv => tcp.state = TcpState::Established,
                TcpState::LastAck => tcp.state = TcpState::Closing,
                TcpState::Established | TcpState::CloseWait | TcpState::FinWait1 => {}
                _ => {
                    debug!(state = ?tcp.state, "unexpected ACK");
                }
            }
        }
    } else {
        let ack = tcph.acknowledgment_number();

        if ack.wrapping_add(1) == tcp.local_seq {
            // Keep-alive probe from the guest.
            if tcp.state == TcpState::Established {
                if let Some(sock) = socket.as_ref() {
                    let _ = setsockopt(sock.as_raw_fd(), sockopt::KeepAlive, &true);
                }
            }
        } else if compare_u32(ack, tcp.local_seq) < 0 {
            if compare_u32(ack, tcp.acked) <= 0 {
                // Duplicate or delayed ACK.
            } else {
                tcp.acked = ack;
            }
        } else {
            warn!("guest acknowledged data never sent");
            write_rst(args, tcp);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_syn(
    args: &Arguments,
    table: &mut SessionTable,
    epoll_fd: RawFd,
    flow: Flow,
    tcph: &TcpHeaderSlice,
    data: &[u8],
    uid: i32,
    allowed: bool,
    redirect: Option<&Redirect>,
) {
    let quad = flow.quad;

    let mut mss = get_default_mss(quad.version());
    let mut ws = 0u8;
    for option in tcph.options_iterator().flatten() {
        match option {
            TcpOptionElement::MaximumSegmentSize(value) => mss = value,
            TcpOptionElement::WindowScale(value) => ws = value,
            _ => {}
        }
    }

    let local_seq = rand::random::<u32>();
    let remote_seq = tcph.sequence_number();

    let mut tcp = TcpSession {
        quad,
        state: TcpState::Listen,
        socks5: Socks5State::None,
        local_seq,
        local_start: local_seq,
        remote_seq,
        remote_start: remote_seq,
        acked: 0,
        send_window: (tcph.window_size() as u32) << ws,
        recv_window: 0,
        mss,
        recv_scale: ws,
        send_scale: ws,
        time: get_ms(),
        last_keep_alive: 0,
        unconfirmed: 0,
        sent: 0,
        received: 0,
        forward: ForwardQueue::new(),
    };

    // Data riding on the SYN; its sequence is accounted for when the
    // SYN itself is consumed before the SYN/ACK.
    if !data.is_empty() {
        tcp.forward.enqueue(remote_seq, tcph.psh(), data, remote_seq);
    }

    let sock = match open_tcp_socket(args, &tcp, redirect) {
        Ok(sock) => sock,
        Err(err) => {
            warn!(%err, "failed to open tcp socket");
            return;
        }
    };

    let fd = sock.as_raw_fd();
    let socket = Some(sock);
    tcp.recv_window = get_receive_window(&socket, &tcp);

    let token = table.alloc_token();
    let events = EpollFlags::EPOLLOUT | EpollFlags::EPOLLERR;
    let mut ev = EpollEvent::new(events, token);
    if let Err(err) = epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, fd, &mut ev) {
        warn!(%err, "failed to watch tcp socket");
        return;
    }

    debug!(
        src = %quad.src.addr, sport = quad.src.port,
        dst = %quad.dst.addr, dport = quad.dst.port,
        mss, ws, "new tcp session"
    );

    let mut session = Session {
        token,
        socket,
        events,
        uid,
        kind: Kind::Tcp(tcp),
    };

    if !allowed {
        if let Kind::Tcp(tcp) = &mut session.kind {
            write_rst(args, tcp);
        }
    }

    table.insert(flow, session);
}

/// Host-socket readiness for one TCP session.
pub fn check_tcp_socket(args: &Arguments, session: &mut Session, ready: EpollFlags) {
    let Session { socket, kind, .. } = session;
    let Kind::Tcp(tcp) = kind else { return };

    if ready.contains(EpollFlags::EPOLLERR) {
        tcp.time = get_ms();
        if let Some(sock) = socket.as_ref() {
            if let Ok(serr) = getsockopt(sock.as_raw_fd(), sockopt::SocketError) {
                warn!(error = serr, "tcp socket error");
            }
        }
        write_rst(args, tcp);
    } else if tcp.state == TcpState::Listen {
        check_socks5(args, socket, tcp, ready);
    } else {
        let mut fwd = false;

        if ready.contains(EpollFlags::EPOLLOUT) {
            fwd = forward_queue_to_socket(args, socket, tcp);
        }

        let window = get_receive_window(socket, tcp);
        let prev = tcp.recv_window;
        tcp.recv_window = window;

        if fwd || (prev == 0 && window > 0) {
            if fwd && tcp.forward.is_empty() && tcp.state == TcpState::CloseWait {
                // Account for the guest's FIN that was deferred behind
                // the queued data.
                tcp.remote_seq = tcp.remote_seq.wrapping_add(1);
            }
            if write_ack(args, tcp) {
                tcp.time = get_ms();
            }
        }

        if tcp.state == TcpState::Established || tcp.state == TcpState::CloseWait {
            let send_window = get_send_window(tcp);
            if ready.contains(EpollFlags::EPOLLIN) && send_window > 0 {
                relay_socket_to_guest(args, socket, tcp, send_window);
            }
        }
    }
}

/// SOCKS5 sub-state machine (or the direct-connect fast path) while the
/// session is in LISTEN.
fn check_socks5(
    args: &Arguments,
    socket: &mut Option<OwnedFd>,
    cur: &mut TcpSession,
    ready: EpollFlags,
) {
    let Some(fd) = socket.as_ref().map(|s| s.as_raw_fd()) else {
        return;
    };

    if cur.socks5 == Socks5State::None {
        if ready.contains(EpollFlags::EPOLLOUT) {
            cur.socks5 = if args.ctx.socks5.is_some() {
                Socks5State::Hello
            } else {
                Socks5State::Connected
            };
        }
    } else if ready.contains(EpollFlags::EPOLLIN) {
        let mut buffer = [0u8; 32];
        match recv(fd, &mut buffer, MsgFlags::empty()) {
            Err(err) => {
                warn!(%err, "socks5 recv error");
                write_rst(args, cur);
            }
            Ok(bytes) => {
                match socks5::handle_reply(cur.socks5, cur.quad.version(), &buffer[..bytes]) {
                    Some(next) => cur.socks5 = next,
                    None => {
                        warn!(state = ?cur.socks5, "unexpected socks5 reply");
                        cur.socks5 = Socks5State::None;
                        write_rst(args, cur);
                    }
                }
            }
        }
    }

    match cur.socks5 {
        Socks5State::Hello => {
            let _ = send(fd, &socks5::greeting(), MsgFlags::MSG_NOSIGNAL);
        }
        Socks5State::Auth => {
            if let Some(config) = &args.ctx.socks5 {
                let _ = send(fd, &socks5::auth_request(config), MsgFlags::MSG_NOSIGNAL);
            }
        }
        Socks5State::Connect => {
            let _ = send(
                fd,
                &socks5::connect_request(&cur.quad),
                MsgFlags::MSG_NOSIGNAL,
            );
        }
        Socks5State::Connected => {
            // The SYN consumes one sequence number; acknowledge it now
            // that the upstream path exists.
            cur.remote_seq = cur.remote_seq.wrapping_add(1);
            if write_syn_ack(args, cur) {
                cur.time = get_ms();
                cur.local_seq = cur.local_seq.wrapping_add(1);
                cur.state = TcpState::SynRecv;
            }
        }
        Socks5State::None => {}
    }
}

/// Drains in-order forward segments into the host socket while its send
/// buffer has room. Returns true when any bytes moved.
fn forward_queue_to_socket(
    args: &Arguments,
    socket: &mut Option<OwnedFd>,
    cur: &mut TcpSession,
) -> bool {
    let mut fwd = false;
    let mut buffer_size = get_receive_buffer(socket);

    loop {
        let Some(fd) = socket.as_ref().map(|s| s.as_raw_fd()) else {
            break;
        };

        let sendable = match cur.forward.head() {
            Some(head) => head.seq == cur.remote_seq && (head.remaining() as u32) < buffer_size,
            None => false,
        };
        if !sendable {
            break;
        }

        let result = {
            let head = cur.forward.head().unwrap();
            let flags = if head.psh {
                MsgFlags::MSG_NOSIGNAL
            } else {
                MsgFlags::MSG_NOSIGNAL | MsgFlags::from_bits_truncate(libc::MSG_MORE)
            };
            send(fd, &head.data[head.sent..], flags)
        };

        match result {
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => break,
            Err(err) => {
                warn!(%err, "forward write failed");
                write_rst(args, cur);
                break;
            }
            Ok(sent) => {
                fwd = true;
                buffer_size -= sent as u32;
                cur.sent += sent as u64;

                let head = cur.forward.head_mut().unwrap();
                head.sent += sent;

                if head.len() == head.sent {
                    let advanced = head.seq.wrapping_add(head.sent as u32);
                    cur.forward.pop();
                    cur.remote_seq = advanced;
                } else {
                    break;
                }
            }
        }
    }

    fwd
}

/// One recv from the host socket, framed toward the guest. recv of zero
/// bytes means the host side finished: FIN cleanly, or RST when guest
/// data is still queued.
fn relay_socket_to_guest(
    args: &Arguments,
    socket: &mut Option<OwnedFd>,
    cur: &mut TcpSession,
    send_window: u32,
) {
    let Some(fd) = socket.as_ref().map(|s| s.as_raw_fd()) else {
        return;
    };

    cur.time = get_ms();

    let buffer_size = send_window.min(cur.mss as u32) as usize;
    let mut buffer = vec![0u8; buffer_size];

    match recv(fd, &mut buffer, MsgFlags::empty()) {
        Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
        Err(err) => {
            warn!(%err, "tcp recv error");
            write_rst(args, cur);
        }
        Ok(0) => {
            if cur.forward.is_empty() {
                if write_fin_ack(args, cur) {
                    cur.local_seq = cur.local_seq.wrapping_add(1);
                }
                match cur.state {
                    TcpState::Established => cur.state = TcpState::FinWait1,
                    TcpState::CloseWait => cur.state = TcpState::LastAck,
                    _ => {}
                }
            } else {
                warn!("host closed with guest data pending");
                write_rst(args, cur);
            }

            *socket = None;
        }
        Ok(bytes) => {
            cur.received += bytes as u64;
            if write_data(args, cur, &buffer[..bytes]) {
                cur.local_seq = cur.local_seq.wrapping_add(bytes as u32);
                cur.unconfirmed += 1;
            }
        }
    }
}

/// Opens the non-blocking host socket for a new session: toward the
/// classifier redirect, the SOCKS5 proxy, or the guest's destination.
fn open_tcp_socket(
    args: &Arguments,
    cur: &TcpSession,
    redirect: Option<&Redirect>,
) -> Result<OwnedFd, Error> {
    let (addr, port) = if let Some(redirect) = redirect {
        (redirect.addr, redirect.port)
    } else if let Some(config) = &args.ctx.socks5 {
        (config.addr, config.port)
    } else {
        (cur.quad.dst.addr, cur.quad.dst.port)
    };

    let family = match addr {
        IpAddr::V4(_) => AddressFamily::Inet,
        IpAddr::V6(_) => AddressFamily::Inet6,
    };

    let fd = socket(
        family,
        nix::sys::socket::SockType::Stream,
        SockFlag::SOCK_NONBLOCK,
        SockProtocol::Tcp,
    )
    .map_err(Error::Socket)?;
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    setsockopt(sock.as_raw_fd(), sockopt::TcpNoDelay, &true).map_err(Error::Socket)?;

    let connected = match addr {
        IpAddr::V4(v4) => connect(
            sock.as_raw_fd(),
            &SockaddrIn::from(SocketAddrV4::new(v4, port)),
        ),
        IpAddr::V6(v6) => connect(
            sock.as_raw_fd(),
            &SockaddrIn6::from(SocketAddrV6::new(v6, port, 0, 0)),
        ),
    };

    match connected {
        Ok(()) | Err(Errno::EINPROGRESS) => Ok(sock),
        Err(err) => Err(Error::Socket(err)),
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn session() -> TcpSession {
        let quad = Quad {
            src: Dual {
                addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                port: 40000,
            },
            dst: Dual {
                addr: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
                port: 80,
            },
        };
        let mut cur = TcpSession::stateless(quad, 0, 0);
        cur.state = TcpState::Established;
        cur
    }

    #[test]
    fn send_window_subtracts_inflight_and_headroom() {
        let mut cur = session();
        cur.send_window = 65535;
        cur.local_seq = 5000;
        cur.acked = 5000;

        assert_eq!(get_send_window(&cur), 65535 - 40);

        cur.local_seq = 5100;
        assert_eq!(get_send_window(&cur), 65535 - 100 - 40);

        cur.unconfirmed = 2;
        assert_eq!(get_send_window(&cur), 65535 - 100 - 120);
    }

    #[test]
    fn send_window_is_zero_when_guest_is_full() {
        let mut cur = session();
        cur.send_window = 100;
        cur.local_seq = 5100;
        cur.acked = 5000;

        assert_eq!(get_send_window(&cur), 0);
    }

    #[test]
    fn timeouts_follow_state_and_pressure() {
        let mut cur = session();

        cur.state = TcpState::Listen;
        assert_eq!(get_tcp_timeout(&cur, 0, 100), TCP_INIT_TIMEOUT);

        cur.state = TcpState::Established;
        assert_eq!(get_tcp_timeout(&cur, 0, 100), TCP_IDLE_TIMEOUT);
        assert_eq!(get_tcp_timeout(&cur, 50, 100), TCP_IDLE_TIMEOUT / 2);

        cur.state = TcpState::FinWait1;
        assert_eq!(get_tcp_timeout(&cur, 0, 100), TCP_CLOSE_TIMEOUT);
    }
}
