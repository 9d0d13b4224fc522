//! Loopback TCP port allocation and liveness probing.

use anyhow::{Context, Result as Fallible};
use std::net::{Ipv4Addr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Marker written to stderr by a worker that could not bind its port;
/// the facade keys on it to relaunch once with a fresh port.
pub const BIND_FAILURE_MARKER: &str = "could not bind";

/// Pick a currently-free loopback port.
///
/// The OS chooses: a temporary socket is bound to port 0 and the
/// assigned port read back. The socket is closed before returning, so a
/// small race window remains; callers tolerate it by retrying the
/// launch when the worker reports a bind failure.
pub fn reserve() -> Fallible<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .context("could not bind a loopback probe socket")?;
    let port = listener
        .local_addr()
        .context("could not read back the probe socket address")?
        .port();
    Ok(port)
}

/// True when something accepts TCP connections on `host:port`.
///
/// TCP only; UDP and higher-level protocols are out of scope.
pub fn is_in_use(host: &str, port: u16, timeout: Duration) -> bool {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(_) => return false,
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ports_are_nonzero_and_plausible() {
        let port = reserve().unwrap();
        assert!(port >= 1024);
    }

    #[test]
    fn bound_ports_probe_as_in_use() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_in_use("127.0.0.1", port, Duration::from_millis(200)));
    }

    #[test]
    fn released_ports_probe_as_free() {
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!is_in_use("127.0.0.1", port, Duration::from_millis(200)));
    }

    #[test]
    fn unresolvable_hosts_probe_as_free() {
        assert!(!is_in_use("", 80, Duration::from_millis(50)));
    }
}
