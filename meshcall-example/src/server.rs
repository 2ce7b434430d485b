// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use service::{init_tracing, serve};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Parser)]
struct Flags {
    /// Sets the address to listen on.
    #[clap(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    ip: IpAddr,
    /// Sets the port number to listen on.
    #[clap(long, default_value_t = meshcall::server::DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing("Meshcall Example Server")?;

    let (local_addr, task) = serve(SocketAddr::new(flags.ip, flags.port)).await?;
    tracing::info!("message server listening on {local_addr}");
    task.await?;

    Ok(())
}
