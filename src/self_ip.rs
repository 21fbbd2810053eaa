//! Discovery of this host's outward-facing IPv4 address.
//!
//! Connecting a UDP socket sends nothing on the wire, but makes the OS pick
//! the local address it would route through; that address is the one
//! LAN clients can reach us on.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::debug;

use crate::error::Error;

/// Return the local address used to reach the first probe target that
/// yields one.
pub fn discover<I, S>(targets: I) -> Result<Ipv4Addr, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    targets
        .into_iter()
        .find_map(|target| {
            let target = target.as_ref();
            match probe(target) {
                Ok(ip) => Some(ip),
                Err(e) => {
                    debug!(probe = target, error = %e, "self address probe failed");
                    None
                }
            }
        })
        .ok_or(Error::SelfAddrUnavailable)
}

fn probe(target: &str) -> std::io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(target)?;

    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("unusable local address {other}"),
        )),
    }
}
