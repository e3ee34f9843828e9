//! User-space network stack terminating a TUN device.
//!
//! Raw IP datagrams read from an already-open TUN descriptor are
//! demultiplexed into per-flow sessions and proxied through the host
//! kernel's socket API by a single cooperative event loop. TCP flows
//! are terminated toward the guest (handshake, cumulative ACKs, window
//! advertisement) and optionally carried upstream through a SOCKS5
//! proxy; UDP is relayed with a DNS redirect hook; ICMP echoes are
//! forwarded structurally.

use std::net::IpAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::unistd::{pipe, write};
use tracing::warn;

mod err;
mod event;
mod host;
mod icmp;
mod ip;
mod session;
mod tcp;
mod udp;
mod util;

#[cfg(test)]
mod testutil;

pub use err::Error;
pub use host::{AllowAll, Direction, Monitor, Redirect, Verdict};

use session::SessionTable;

pub(crate) const SESSION_LIMIT: usize = 40; // percent of the fd soft limit
pub(crate) const SESSION_MAX: usize = 4096;

pub(crate) const ICMP_TIMEOUT: i64 = 15; // seconds
pub(crate) const UDP_TIMEOUT_53: i64 = 15;
pub(crate) const UDP_TIMEOUT_ANY: i64 = 300;
pub(crate) const UDP_KEEP_TIMEOUT: i64 = 60;
pub(crate) const TCP_INIT_TIMEOUT: i64 = 20;
pub(crate) const TCP_IDLE_TIMEOUT: i64 = 3600;
pub(crate) const TCP_CLOSE_TIMEOUT: i64 = 20;
pub(crate) const TCP_KEEP_TIMEOUT: i64 = 300;

pub(crate) const UDP4_MAXMSG: u16 = 65507;
pub(crate) const UDP6_MAXMSG: u16 = 65487;

pub(crate) const EPOLL_TIMEOUT: i64 = 3600; // seconds
pub(crate) const EPOLL_EVENTS: usize = 20;
pub(crate) const EPOLL_MIN_CHECK: i64 = 100; // milliseconds
pub(crate) const TUN_YIELD: usize = 10;
pub(crate) const UDP_YIELD: usize = 10;

pub(crate) const SEND_BUF_DEFAULT: usize = 163840;
pub(crate) const IPDEFTTL: u8 = 64;

/// Immutable SOCKS5 egress configuration, snapshotted into the
/// [`Context`] at construction.
#[derive(Debug, Clone)]
pub struct Socks5Config {
    pub addr: IpAddr,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Per-run parameters and the host seam, threaded through the loop.
pub(crate) struct Arguments<'a> {
    pub tun: RawFd,
    pub fwd53: bool,
    pub rcode: i32,
    pub monitor: &'a dyn Monitor,
    pub ctx: &'a Context,
}

/// Process-wide state for one active tunnel: the session table, a
/// self-pipe for wakeups and the stop flag. Dropping the context
/// releases every session and its host socket.
pub struct Context {
    sdk: i32,
    stopping: AtomicBool,
    sessions: Mutex<SessionTable>,
    pipe_read: OwnedFd,
    pipe_write: OwnedFd,
    pub(crate) socks5: Option<Socks5Config>,
}

impl Context {
    /// Allocates the context and raises the file-descriptor soft limit
    /// to the hard limit; the session budget derives from it in
    /// [`Context::run`].
    pub fn new(sdk: i32, socks5: Option<Socks5Config>) -> Result<Self, Error> {
        match getrlimit(Resource::RLIMIT_NOFILE) {
            Ok((_soft, hard)) => {
                if let Err(err) = setrlimit(Resource::RLIMIT_NOFILE, hard, hard) {
                    warn!(%err, "failed to raise fd limit");
                }
            }
            Err(err) => warn!(%err, "failed to read fd limit"),
        }

        let (pipe_read, pipe_write) = pipe().map_err(Error::Loop)?;

        Ok(Context {
            sdk,
            stopping: AtomicBool::new(false),
            sessions: Mutex::new(SessionTable::new()),
            pipe_read: unsafe { OwnedFd::from_raw_fd(pipe_read) },
            pipe_write: unsafe { OwnedFd::from_raw_fd(pipe_write) },
            socks5,
        })
    }

    /// Clears the stop flag before a run.
    pub fn start(&self) {
        self.stopping.store(false, Ordering::Release);
    }

    /// Enters the event loop on the calling thread. `tun` is an
    /// already-open descriptor carrying raw IP datagrams; the caller
    /// keeps ownership. Returns on [`Context::stop`] or a loop-fatal
    /// error.
    pub fn run(
        &self,
        tun: RawFd,
        fwd53: bool,
        rcode: i32,
        monitor: &dyn Monitor,
    ) -> Result<(), Error> {
        let args = Arguments {
            tun,
            fwd53,
            rcode,
            monitor,
            ctx: self,
        };
        event::handle_events(&args)
    }

    /// Sets the stop flag and wakes the loop. Callable from any thread.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        let _ = write(self.pipe_write.as_raw_fd(), b"w");
    }

    /// Drops every live session under the context lock. A no-op on an
    /// empty table.
    pub fn clear_sessions(&self) {
        self.lock_sessions().clear();
    }

    /// Platform-version hint supplied by the host.
    pub fn sdk(&self) -> i32 {
        self.sdk
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn lock_sessions(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap()
    }

    pub(crate) fn pipe_read(&self) -> RawFd {
        self.pipe_read.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::net::{Ipv4Addr, Shutdown, TcpListener};
    use std::os::fd::AsRawFd;
    use std::thread;

    use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice};
    use nix::sys::epoll::{
        epoll_create1, epoll_ctl, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
    };
    use nix::unistd::write as fd_write;

    use super::*;
    use crate::host::AllowAll;
    use crate::ip::handle_ip;
    use crate::session::{Dual, Flow, Kind, Protocol, Quad, Session};
    use crate::tcp::{self, Socks5State, TcpSession, TcpState};
    use crate::testutil::{read_frame, tun_pair, GuestTcp};

    fn tcp_of(frame: &[u8]) -> (Ipv4HeaderSlice<'_>, TcpHeaderSlice<'_>, usize) {
        let ip = Ipv4HeaderSlice::from_slice(frame).unwrap();
        let header_len = ip.ihl() as usize * 4;
        let tcph = TcpHeaderSlice::from_slice(&frame[header_len..]).unwrap();
        let data_off = header_len + tcph.data_offset() as usize * 4;
        (ip, tcph, data_off)
    }

    fn wait_for_frame(fd: RawFd, pred: impl Fn(&[u8]) -> bool) -> Vec<u8> {
        for _ in 0..100 {
            if let Some(frame) = read_frame(fd, 100) {
                if pred(&frame) {
                    return frame;
                }
            }
        }
        panic!("expected frame never arrived");
    }

    fn syn_packet(dport: u16) -> Vec<u8> {
        GuestTcp {
            src: Ipv4Addr::new(10, 0, 0, 2),
            sport: 40000,
            dst: Ipv4Addr::new(127, 0, 0, 1),
            dport,
            seq: 0x1000,
            ack: None,
            window: 65535,
            syn: true,
            fin: false,
            rst: false,
            mss: Some(1460),
            ws: Some(7),
            payload: Vec::new(),
        }
        .build()
    }

    #[test]
    fn terminates_handshake_and_relays_bytes() {
        let ctx = Context::new(29, None).unwrap();
        let (tun_host, tun_core) = tun_pair();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let monitor = AllowAll;

        ctx.start();
        thread::scope(|s| {
            let core = s.spawn(|| ctx.run(tun_core.as_raw_fd(), true, 3, &monitor));

            fd_write(tun_host.as_raw_fd(), &syn_packet(port)).unwrap();

            let synack = wait_for_frame(tun_host.as_raw_fd(), |f| {
                let (_, tcph, _) = tcp_of(f);
                tcph.syn() && tcph.ack()
            });
            let (ip, tcph, _) = tcp_of(&synack);
            assert_eq!(ip.source_addr(), Ipv4Addr::new(127, 0, 0, 1));
            assert_eq!(tcph.source_port(), port);
            assert_eq!(tcph.destination_port(), 40000);
            assert_eq!(tcph.acknowledgment_number(), 0x1001);
            let r = tcph.sequence_number();

            // Guest completes the handshake.
            let ack = GuestTcp {
                src: Ipv4Addr::new(10, 0, 0, 2),
                sport: 40000,
                dst: Ipv4Addr::new(127, 0, 0, 1),
                dport: port,
                seq: 0x1001,
                ack: Some(r.wrapping_add(1)),
                window: 65535,
                syn: false,
                fin: false,
                rst: false,
                mss: None,
                ws: None,
                payload: Vec::new(),
            }
            .build();
            fd_write(tun_host.as_raw_fd(), &ack).unwrap();

            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"HI").unwrap();

            let data = wait_for_frame(tun_host.as_raw_fd(), |f| {
                let (_, tcph, off) = tcp_of(f);
                tcph.psh() && f.len() > off
            });
            let (_, tcph, off) = tcp_of(&data);
            assert_eq!(&data[off..], b"HI");
            assert_eq!(tcph.sequence_number(), r.wrapping_add(1));
            assert_eq!(tcph.acknowledgment_number(), 0x1001);

            // Host half-close: recv of zero with an empty forward queue
            // becomes a FIN/ACK toward the guest.
            stream.shutdown(Shutdown::Write).unwrap();
            let fin = wait_for_frame(tun_host.as_raw_fd(), |f| tcp_of(f).1.fin());
            let (_, tcph, _) = tcp_of(&fin);
            assert_eq!(tcph.sequence_number(), r.wrapping_add(3));
            assert_eq!(tcph.acknowledgment_number(), 0x1001);

            ctx.stop();
            core.join().unwrap().unwrap();
        });
    }

    #[test]
    fn denied_syn_creates_session_and_resets() {
        struct DenyAll;
        impl Monitor for DenyAll {
            fn classify(&self, _packet: &[u8], _direction: Direction) -> Verdict {
                Verdict::deny()
            }
        }

        let ctx = Context::new(0, None).unwrap();
        let (tun_host, tun_core) = tun_pair();
        let monitor = DenyAll;
        let args = Arguments {
            tun: tun_core.as_raw_fd(),
            fwd53: true,
            rcode: 3,
            monitor: &monitor,
            ctx: &ctx,
        };
        let epoll_fd = epoll_create1(EpollCreateFlags::empty()).unwrap();
        let mut table = SessionTable::new();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        handle_ip(&args, &mut table, epoll_fd, &syn_packet(port), 0, 100);

        // The session exists; housekeeping will reap it.
        assert_eq!(table.len(), 1);

        let frame = read_frame(tun_host.as_raw_fd(), 2000).expect("expected a RST");
        let (_, tcph, _) = tcp_of(&frame);
        assert!(tcph.rst());
        assert_eq!(tcph.acknowledgment_number(), 0x1001);

        let flow = Flow {
            protocol: Protocol::Tcp,
            quad: Quad {
                src: Dual {
                    addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                    port: 40000,
                },
                dst: Dual {
                    addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                    port,
                },
            },
        };
        let Kind::Tcp(session) = &table.get_mut(&flow).unwrap().kind else {
            unreachable!()
        };
        assert_eq!(session.state, TcpState::Closing);

        nix::unistd::close(epoll_fd).unwrap();
    }

    #[test]
    fn retransmitted_syn_keeps_sequence_numbers() {
        let ctx = Context::new(0, None).unwrap();
        let (_tun_host, tun_core) = tun_pair();
        let monitor = AllowAll;
        let args = Arguments {
            tun: tun_core.as_raw_fd(),
            fwd53: true,
            rcode: 3,
            monitor: &monitor,
            ctx: &ctx,
        };
        let epoll_fd = epoll_create1(EpollCreateFlags::empty()).unwrap();
        let mut table = SessionTable::new();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let syn = syn_packet(port);

        handle_ip(&args, &mut table, epoll_fd, &syn, 0, 100);

        let flow = Flow {
            protocol: Protocol::Tcp,
            quad: Quad {
                src: Dual {
                    addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                    port: 40000,
                },
                dst: Dual {
                    addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                    port,
                },
            },
        };

        let (local_seq, remote_seq) = {
            let Kind::Tcp(session) = &table.get_mut(&flow).unwrap().kind else {
                unreachable!()
            };
            (session.local_seq, session.remote_seq)
        };

        handle_ip(&args, &mut table, epoll_fd, &syn, 0, 100);

        assert_eq!(table.len(), 1);
        let Kind::Tcp(session) = &table.get_mut(&flow).unwrap().kind else {
            unreachable!()
        };
        assert_eq!(session.local_seq, local_seq);
        assert_eq!(session.remote_seq, remote_seq);

        nix::unistd::close(epoll_fd).unwrap();
    }

    #[test]
    fn zero_window_probes_once_per_interval() {
        let ctx = Context::new(0, None).unwrap();
        let (tun_host, tun_core) = tun_pair();
        let monitor = AllowAll;
        let args = Arguments {
            tun: tun_core.as_raw_fd(),
            fwd53: true,
            rcode: 3,
            monitor: &monitor,
            ctx: &ctx,
        };
        let epoll_fd = epoll_create1(EpollCreateFlags::empty()).unwrap();

        let (_peer, sock) = tun_pair();
        let token = 5u64;
        let events = EpollFlags::EPOLLOUT | EpollFlags::EPOLLERR;
        let mut ev = EpollEvent::new(events, token);
        epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, sock.as_raw_fd(), &mut ev).unwrap();

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
        let mut session = Session {
            token,
            socket: Some(sock),
            events,
            uid: -1,
            kind: Kind::Tcp(TcpSession {
                quad,
                state: TcpState::Established,
                socks5: Socks5State::Connected,
                local_seq: 100,
                local_start: 100,
                remote_seq: 0x2000,
                remote_start: 0x2000,
                acked: 100,
                send_window: 0,
                recv_window: 65535,
                mss: 1460,
                recv_scale: 0,
                send_scale: 0,
                time: crate::util::get_ms(),
                last_keep_alive: 0,
                unconfirmed: 0,
                sent: 0,
                received: 0,
                forward: crate::tcp::segment::ForwardQueue::new(),
            }),
        };

        let recheck = tcp::monitor_tcp_session(&args, &mut session, epoll_fd);
        assert!(recheck);
        // A second pass inside the same check interval adds no probe.
        tcp::monitor_tcp_session(&args, &mut session, epoll_fd);

        let probe = read_frame(tun_host.as_raw_fd(), 2000).expect("expected keep-alive probe");
        let (_, tcph, _) = tcp_of(&probe);
        assert!(tcph.ack());
        assert_eq!(tcph.acknowledgment_number(), 0x2000 - 1);

        assert!(read_frame(tun_host.as_raw_fd(), 150).is_none());

        nix::unistd::close(epoll_fd).unwrap();
    }

    #[test]
    fn closing_session_drops_its_socket() {
        let ctx = Context::new(0, None).unwrap();
        let (_tun_host, tun_core) = tun_pair();
        let monitor = AllowAll;
        let args = Arguments {
            tun: tun_core.as_raw_fd(),
            fwd53: true,
            rcode: 3,
            monitor: &monitor,
            ctx: &ctx,
        };

        let (_peer, sock) = tun_pair();
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
        let mut session = Session {
            token: 9,
            socket: Some(sock),
            events: EpollFlags::EPOLLERR,
            uid: -1,
            kind: Kind::Tcp(TcpSession {
                quad,
                state: TcpState::Closing,
                socks5: Socks5State::Connected,
                local_seq: 100,
                local_start: 100,
                remote_seq: 0x2000,
                remote_start: 0x2000,
                acked: 100,
                send_window: 65535,
                recv_window: 65535,
                mss: 1460,
                recv_scale: 0,
                send_scale: 0,
                time: crate::util::get_ms(),
                last_keep_alive: 0,
                unconfirmed: 0,
                sent: 1,
                received: 1,
                forward: crate::tcp::segment::ForwardQueue::new(),
            }),
        };

        let del = tcp::check_tcp_session(&args, &mut session, 0, 100);
        assert!(!del);

        // Terminal states hold no host socket.
        assert!(session.socket.is_none());
        let Kind::Tcp(tcp) = &session.kind else {
            unreachable!()
        };
        assert_eq!(tcp.state, TcpState::Close);
        assert_eq!(tcp.sent, 0);
        assert_eq!(tcp.received, 0);
    }

    #[test]
    fn clear_sessions_is_idempotent_on_empty() {
        let ctx = Context::new(0, None).unwrap();
        ctx.clear_sessions();
        ctx.clear_sessions();
        assert!(ctx.lock_sessions().is_empty());
    }
}
