// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Runs a few message servers in process, registers them in an in-memory coordination
//! service and calls them through a discovering client while they come and go.

use clap::Parser;
use meshcall::client::balance::LoadBalanceKind;
use meshcall::client::discover::{Discover, RegistryDiscover};
use meshcall::registry::{MemoryCoordinator, ServicePath};
use meshcall::server::{RegisterConfig, Registrar};
use meshcall::Client;
use service::{init_tracing, message_service, serve, SERVICE_NAME};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
struct Flags {
    /// Sets how many servers to start.
    #[clap(long, default_value_t = 3)]
    servers: u8,
    /// Sets how many messages to send per round.
    #[clap(long, default_value_t = 6)]
    calls: usize,
    /// Sets the version segment of the registration path.
    #[clap(long, default_value = "1.0.0")]
    version: String,
    /// Sets the sleep between attempts, e.g. `200ms`.
    #[clap(long, value_parser = humantime::parse_duration, default_value = "200ms")]
    retry_interval: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing("Meshcall Demo")?;

    let coordinator = MemoryCoordinator::new();
    let path = ServicePath::default().with_version(flags.version.clone());
    let mut registrars = Vec::new();
    for weight in 1..=u32::from(flags.servers) {
        let (addr, _task) = serve(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
        let config = RegisterConfig::default().with_path(path.clone()).with_ip(addr.ip()).with_port(addr.port()).with_weight(weight);
        let registrar = Arc::new(Registrar::new(coordinator.new_session(), config));
        registrar.register().await?;
        registrar.spawn_keepalive();
        registrars.push(registrar);
    }

    let discover = RegistryDiscover::new(coordinator.clone(), &path, LoadBalanceKind::Random);
    let client = Client::builder(discover).service(message_service()).with_retry_interval(flags.retry_interval).build().await?;
    let mut changes = client.discover().watch().ok_or_else(|| anyhow::anyhow!("discovery publishes no changes"))?;
    let message = client.get_client(SERVICE_NAME)?;

    for round in 0..=registrars.len() {
        let nodes = client.discover().nodes().await;
        tracing::info!("round {round}: {} live node(s)", nodes.len());
        for i in 0..flags.calls {
            match message.call("send_sms", meshcall::args!["110", format!("message #{i} of round {round}")]).await {
                Ok(receipt) => tracing::info!("{receipt}"),
                Err(e) => tracing::warn!("{:?}", anyhow::Error::from(e)),
            }
        }
        if let Some(registrar) = registrars.pop() {
            registrar.deregister().await?;
            registrar.stop();
            changes.recv().await?;
        }
    }
    client.close().await;

    Ok(())
}
