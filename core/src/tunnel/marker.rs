//! Ready marker: the single control line a tunnel subprocess prints on stdout
//! once its listener is bound.

use std::fmt;

pub const MARKER_PREFIX: &str = "Tunnel listening on ";
pub const LISTEN_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyMarker {
    pub local_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl ReadyMarker {
    pub fn new(local_port: u16, target_host: &str, target_port: u16) -> Self {
        ReadyMarker {
            local_port,
            target_host: target_host.to_string(),
            target_port,
        }
    }

    /// Parse `Tunnel listening on 127.0.0.1:<local> -> <host>:<port>`.
    pub fn parse(line: &str) -> Option<ReadyMarker> {
        let rest = line.trim().strip_prefix(MARKER_PREFIX)?;
        let (listen, target) = rest.split_once(" -> ")?;
        let local_port = listen
            .strip_prefix(LISTEN_HOST)?
            .strip_prefix(':')?
            .parse()
            .ok()?;
        let (host, port) = target.trim().rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        Some(ReadyMarker {
            local_port,
            target_host: host.to_string(),
            target_port: port.parse().ok()?,
        })
    }

    pub fn matches(&self, target_host: &str, target_port: u16, local_port: u16) -> bool {
        self.local_port == local_port
            && self.target_host == target_host
            && self.target_port == target_port
    }
}

impl fmt::Display for ReadyMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{} -> {}:{}",
            MARKER_PREFIX, LISTEN_HOST, self.local_port, self.target_host, self.target_port
        )
    }
}
