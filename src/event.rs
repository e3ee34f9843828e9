use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::sys::resource::{getrlimit, Resource};
use nix::unistd::read;
use tracing::{debug, error};

use crate::err::Error;
use crate::ip::check_tun;
use crate::session::Kind;
use crate::util::{get_ms, is_readable};
use crate::{
    icmp, tcp, udp, Arguments, EPOLL_EVENTS, EPOLL_MIN_CHECK, EPOLL_TIMEOUT, SESSION_LIMIT,
    SESSION_MAX, UDP_YIELD,
};

const TOKEN_PIPE: u64 = 0;
const TOKEN_TUN: u64 = 1;

/// The cooperative dispatcher: owns readiness registration for the TUN
/// device, the wakeup pipe and every session socket, alternates
/// housekeeping with readiness dispatch, and returns on stop or on a
/// loop-fatal error.
pub fn handle_events(args: &Arguments) -> Result<(), Error> {
    let mut maxsessions = SESSION_MAX;
    if let Ok((soft, _hard)) = getrlimit(Resource::RLIMIT_NOFILE) {
        maxsessions = SESSION_MAX.min(soft as usize * SESSION_LIMIT / 100);
    }

    let epoll = unsafe {
        OwnedFd::from_raw_fd(epoll_create1(EpollCreateFlags::empty()).map_err(Error::Loop)?)
    };
    let epoll_fd = epoll.as_raw_fd();

    let mut ev_pipe = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLERR, TOKEN_PIPE);
    epoll_ctl(
        epoll_fd,
        EpollOp::EpollCtlAdd,
        args.ctx.pipe_read(),
        &mut ev_pipe,
    )
    .map_err(Error::Loop)?;

    let mut ev_tun = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLERR, TOKEN_TUN);
    epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, args.tun, &mut ev_tun).map_err(Error::Loop)?;

    debug!(
        maxsessions,
        fwd53 = args.fwd53,
        rcode = args.rcode,
        sdk = args.ctx.sdk(),
        "event loop started"
    );

    let mut last_check: i64 = 0;
    while !args.ctx.is_stopping() {
        let mut recheck = false;
        let mut timeout_ms = EPOLL_TIMEOUT * 1000;

        let sessions;
        {
            let mut table = args.ctx.lock_sessions();
            sessions = table.active();

            for (_, session) in table.iter_mut() {
                if matches!(session.kind, Kind::Tcp(_)) && session.socket.is_some() {
                    recheck |= tcp::monitor_tcp_session(args, session, epoll_fd);
                }
            }

            let ms = get_ms();
            if ms - last_check > EPOLL_MIN_CHECK {
                last_check = ms;

                let now = get_ms();
                let mut expired = Vec::new();
                for (flow, session) in table.iter_mut() {
                    let del = match session.kind {
                        Kind::Icmp(_) => icmp::check_icmp_session(session, sessions, maxsessions),
                        Kind::Udp(_) => udp::check_udp_session(session, sessions, maxsessions),
                        Kind::Tcp(_) => {
                            tcp::check_tcp_session(args, session, sessions, maxsessions)
                        }
                    };

                    if del {
                        expired.push(*flow);
                        continue;
                    }

                    // Wake up for the next session expiry.
                    let stimeout = match &session.kind {
                        Kind::Icmp(icmp) if !icmp.stop => Some(
                            icmp.time + icmp::get_icmp_timeout(icmp, sessions, maxsessions) * 1000
                                - now
                                + 1000,
                        ),
                        Kind::Udp(udp) if udp.state == udp::UdpState::Active => Some(
                            udp.time + udp::get_udp_timeout(udp, sessions, maxsessions) * 1000 - now
                                + 1000,
                        ),
                        Kind::Tcp(tcp)
                            if tcp.state != tcp::TcpState::Closing
                                && tcp.state != tcp::TcpState::Close =>
                        {
                            Some(
                                tcp.time + tcp::get_tcp_timeout(tcp, sessions, maxsessions) * 1000
                                    - now
                                    + 1000,
                            )
                        }
                        _ => None,
                    };
                    if let Some(stimeout) = stimeout {
                        if stimeout > 0 && stimeout < timeout_ms {
                            timeout_ms = stimeout;
                        }
                    }
                }

                for flow in expired {
                    if let Some(session) = table.remove(&flow) {
                        debug!(uid = session.uid, protocol = ?flow.protocol, "session reaped");
                    }
                }
            } else {
                recheck = true;
            }
        }

        let mut events = [EpollEvent::empty(); EPOLL_EVENTS];
        let wait = if recheck { EPOLL_MIN_CHECK } else { timeout_ms };
        let ready = match epoll_wait(epoll_fd, &mut events, wait as isize) {
            Err(Errno::EINTR) => continue,
            Err(err) => {
                error!(%err, "epoll wait failed");
                return Err(Error::Loop(err));
            }
            Ok(ready) => ready,
        };

        if ready == 0 {
            continue;
        }

        let mut fatal = false;
        {
            let mut table = args.ctx.lock_sessions();
            for ev in &events[..ready] {
                match ev.data() {
                    TOKEN_PIPE => {
                        let mut byte = [0u8; 1];
                        let _ = read(args.ctx.pipe_read(), &mut byte);
                    }
                    TOKEN_TUN => {
                        if let Err(err) = check_tun(
                            args,
                            &mut table,
                            epoll_fd,
                            ev.events(),
                            sessions,
                            maxsessions,
                        ) {
                            error!(%err, "tun failure");
                            fatal = true;
                        }
                    }
                    token => {
                        let Some(flow) = table.flow_of_token(token) else {
                            continue;
                        };
                        let Some(session) = table.get_mut(&flow) else {
                            continue;
                        };

                        match session.kind {
                            Kind::Icmp(_) => icmp::check_icmp_socket(args, session, ev.events()),
                            Kind::Udp(_) => {
                                if ev.events().contains(EpollFlags::EPOLLERR) {
                                    udp::check_udp_socket(args, session, ev.events());
                                } else {
                                    let mut count = 0;
                                    while count < UDP_YIELD
                                        && !args.ctx.is_stopping()
                                        && ev.events().contains(EpollFlags::EPOLLIN)
                                        && session
                                            .socket
                                            .as_ref()
                                            .map(|s| is_readable(s.as_raw_fd()))
                                            .unwrap_or(false)
                                    {
                                        count += 1;
                                        udp::check_udp_socket(args, session, ev.events());
                                    }
                                }
                            }
                            Kind::Tcp(_) => tcp::check_tcp_socket(args, session, ev.events()),
                        }
                    }
                }

                if fatal {
                    break;
                }
            }
        }

        if fatal {
            break;
        }
    }

    debug!("event loop finished");
    Ok(())
}
