// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Network helpers.

use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use tracing::warn;

/// Returns the IPv4 address of the interface that routes to the outside world, or
/// `127.0.0.1` when there is none.
///
/// No packet is sent: connecting a UDP socket only selects the outgoing interface.
pub fn local_ip() -> IpAddr {
    match outbound_ip() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(err) => {
            warn!("[MESHCALL] failed to detect local ip, using 127.0.0.1: {err}");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        },
    }
}

fn outbound_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
    Ok(socket.local_addr()?.ip())
}
