// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! A `Message` service over tarpc, wired into meshcall.

use futures::prelude::*;
use meshcall::client::discover::Node;
use meshcall::client::service::{Connector, Service};
use meshcall::{Args, ClientError, Value};
use std::net::SocketAddr;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Json;
use tarpc::{client, context};
use tracing_subscriber::EnvFilter;

/// The name clients call the service by.
pub const SERVICE_NAME: &str = "Message";

/// This is the service definition. It looks a lot like a trait definition.
/// It defines one RPC, send_sms, which takes a phone number and a text.
#[tarpc::service]
pub trait Message {
    /// Returns a delivery receipt.
    async fn send_sms(phone: String, text: String) -> String;
}

/// The server side of [`Message`]; the receipt names the server that handled it.
#[derive(Clone)]
pub struct MessageServer {
    /// Address the server listens on.
    pub local_addr: SocketAddr,
    /// Address of the connected client.
    pub peer_addr: SocketAddr,
}

impl Message for MessageServer {
    async fn send_sms(self, _: context::Context, phone: String, text: String) -> String {
        tracing::info!("sms from {} to {phone}: {text}", self.peer_addr);
        format!("{} delivered {text:?} to {phone}", self.local_addr)
    }
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

/// Serves [`Message`] on `addr` with the JSON codec, returning the bound address and the serving task.
pub async fn serve(addr: SocketAddr) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let mut listener = tarpc::serde_transport::tcp::listen(addr, Json::default).await?;
    listener.config_mut().max_frame_length(usize::MAX);
    let local_addr = listener.local_addr();
    let task = tokio::spawn(
        listener
            // Ignore accept errors.
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            .filter_map(|channel| {
                let peer_addr = channel.transport().peer_addr().ok();
                future::ready(peer_addr.map(|peer_addr| (channel, peer_addr)))
            })
            .map(move |(channel, peer_addr)| channel.execute(MessageServer { local_addr, peer_addr }.serve()).for_each(spawn))
            // Max 10 channels.
            .buffer_unordered(10)
            .for_each(|_| async {}),
    );
    Ok((local_addr, task))
}

/// Opens tarpc clients to [`Message`] servers.
pub struct MessageConnector;

impl Connector for MessageConnector {
    type Conn = MessageClient;

    fn connect<'a>(&'a self, node: &'a Node) -> impl Future<Output = Result<Self::Conn, ClientError>> + Send + 'a {
        async move {
            let mut transport = tarpc::serde_transport::tcp::connect(node.host_port(), Json::default);
            transport.config_mut().max_frame_length(usize::MAX);
            let transport = transport.await.map_err(|err| ClientError::ConnectionCreateFailed {
                node: node.host_port().into(),
                reason: err.to_string().into(),
            })?;
            Ok(MessageClient::new(client::Config::default(), transport).spawn())
        }
    }
}

/// The meshcall registration of [`Message`]: `send_sms(phone, text)`.
pub fn message_service() -> Service<MessageConnector> {
    Service::new(SERVICE_NAME, MessageConnector).method("send_sms", |client: &mut MessageClient, args: Args| {
        Box::pin(async move {
            let phone: String = args.get(0)?;
            let text: String = args.get(1)?;
            let receipt = client.send_sms(context::current(), phone, text).await.map_err(ClientError::remote)?;
            Ok(Value::from(receipt))
        })
    })
}

/// Installs a fmt tracing subscriber filtered by `RUST_LOG`, default `info`.
pub fn init_tracing(service_name: &'static str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).try_init().map_err(|err| anyhow::anyhow!(err))?;
    tracing::debug!("{service_name} tracing ready");
    Ok(())
}
