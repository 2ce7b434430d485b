// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use meshcall::client::balance::LoadBalanceKind;
use meshcall::client::discover::FixedDiscover;
use meshcall::Client;
use service::{init_tracing, message_service, SERVICE_NAME};
use std::time::Duration;

#[derive(Parser)]
struct Flags {
    /// Sets the servers to call, as a comma-separated `address:port[:weight]` list.
    #[clap(long, default_value = "127.0.0.1:3068")]
    servers: String,
    /// Sets the phone number to send to.
    #[clap(long, default_value = "110")]
    phone: String,
    /// Sets the text to send.
    #[clap(long, default_value = "hello, world")]
    text: String,
    /// Sets how many messages to send.
    #[clap(long, default_value_t = 1)]
    count: usize,
    /// Sets the number of attempts to get a connection per call.
    #[clap(long, default_value_t = 3)]
    retry: u32,
    /// Sets the sleep between attempts, e.g. `200ms`.
    #[clap(long, value_parser = humantime::parse_duration, default_value = "200ms")]
    retry_interval: Duration,
    /// Balances round-robin instead of randomly.
    #[clap(long)]
    round_robin: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing("Meshcall Example Client")?;

    let kind = if flags.round_robin { LoadBalanceKind::RoundRobin } else { LoadBalanceKind::Random };
    let client = Client::builder(FixedDiscover::new(&flags.servers, kind)?)
        .service(message_service())
        .with_retry(flags.retry)
        .with_retry_interval(flags.retry_interval)
        .build()
        .await?;
    let message = client.get_client(SERVICE_NAME)?;

    for _ in 0..flags.count {
        match message.call("send_sms", meshcall::args![flags.phone, flags.text]).await {
            Ok(receipt) => tracing::info!("{receipt}"),
            Err(e) => tracing::warn!("{:?}", anyhow::Error::from(e)),
        }
    }
    client.close().await;

    Ok(())
}
