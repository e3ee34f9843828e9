#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Event loop error: {0}")]
    Loop(#[source] nix::Error),

    #[error("Tun error: {0}")]
    Tun(#[source] nix::Error),

    #[error("Socket error: {0}")]
    Socket(#[source] nix::Error),

    #[error("Short write to tun: {written} of {length}")]
    ShortWrite { written: usize, length: usize },

    #[error("Packet field error: {0}")]
    Value(#[from] etherparse::ValueError),

    #[error("TCP options do not fit the header")]
    TcpOptions,

    #[error("Packet write error: {0}")]
    Write(#[from] etherparse::WriteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
