//! SOCKS5 (RFC 1928) client used as the TCP egress when configured.

use std::net::IpAddr;

use crate::session::Quad;
use crate::Socks5Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5State {
    None,
    Hello,
    Auth,
    Connect,
    Connected,
}

/// Version identifier offering no-auth and username/password.
pub fn greeting() -> [u8; 4] {
    [5, 2, 0, 2]
}

/// RFC 1929 username/password sub-negotiation request.
pub fn auth_request(config: &Socks5Config) -> Vec<u8> {
    let user = config.username.as_bytes();
    let pass = config.password.as_bytes();
    let ulen = user.len().min(255);
    let plen = pass.len().min(255);

    let mut buffer = Vec::with_capacity(3 + ulen + plen);
    buffer.push(1);
    buffer.push(ulen as u8);
    buffer.extend_from_slice(&user[..ulen]);
    buffer.push(plen as u8);
    buffer.extend_from_slice(&pass[..plen]);
    buffer
}

/// CONNECT request toward the guest's destination.
pub fn connect_request(quad: &Quad) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(22);
    buffer.push(5);
    buffer.push(1);
    buffer.push(0);
    match quad.dst.addr {
        IpAddr::V4(addr) => {
            buffer.push(1);
            buffer.extend_from_slice(&addr.octets());
        }
        IpAddr::V6(addr) => {
            buffer.push(4);
            buffer.extend_from_slice(&addr.octets());
        }
    }
    buffer.extend_from_slice(&quad.dst.port.to_be_bytes());
    buffer
}

/// Reply length the proxy owes us in the CONNECT state.
pub fn connect_reply_len(version: u8) -> usize {
    6 + if version == 4 { 4 } else { 16 }
}

/// Advances the sub-state machine on proxy bytes. `None` means the
/// reply was unacceptable and the session must be reset.
pub fn handle_reply(state: Socks5State, version: u8, reply: &[u8]) -> Option<Socks5State> {
    match state {
        Socks5State::Hello if reply.len() == 2 && reply[0] == 5 => match reply[1] {
            0 => Some(Socks5State::Connect),
            2 => Some(Socks5State::Auth),
            _ => None,
        },
        Socks5State::Auth if reply.len() == 2 && (reply[0] == 1 || reply[0] == 5) => {
            if reply[1] == 0 {
                Some(Socks5State::Connect)
            } else {
                None
            }
        }
        Socks5State::Connect
            if reply.len() == connect_reply_len(version) && reply[0] == 5 && reply[1] == 0 =>
        {
            Some(Socks5State::Connected)
        }
        _ => None,
    }
}
