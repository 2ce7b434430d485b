use meshcall::client::balance::LoadBalanceKind;
use meshcall::client::discover::{Discover, Discovery, Node, RegistryDiscover};
use meshcall::client::pool::PoolStats;
use meshcall::client::service::{Connector, Service};
use meshcall::registry::{Coordinator, CreateMode, MemoryCoordinator, ServicePath};
use meshcall::server::{RegisterConfig, Registrar};
use meshcall::{Args, Client, ClientError, Value};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Loopback;

impl Connector for Loopback {
    type Conn = String;

    fn connect<'a>(&'a self, node: &'a Node) -> impl Future<Output = Result<String, ClientError>> + Send + 'a {
        async move { Ok(node.host_port()) }
    }
}

fn whoami() -> Service<Loopback> {
    Service::new("Whoami", Loopback).method("whoami", |conn: &mut String, _args: Args| Box::pin(async move { Ok(Value::from(conn.clone())) }))
}

fn registrar(zk: &MemoryCoordinator, last_octet: u8) -> Registrar<MemoryCoordinator> {
    let config = RegisterConfig::default().with_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet))).with_port(9000);
    Registrar::new(zk.new_session(), config)
}

async fn next_change(changes: &mut async_broadcast::Receiver<Discovery>) -> anyhow::Result<Vec<String>> {
    let discovery = timeout(WAIT, changes.recv()).await??;
    let mut nodes = discovery.nodes.iter().map(|node| node.host_port()).collect::<Vec<_>>();
    nodes.sort();
    Ok(nodes)
}

#[tokio::test]
async fn membership_changes_reach_the_balancer_and_clear_the_pool() -> anyhow::Result<()> {
    let zk = MemoryCoordinator::new();
    let first = registrar(&zk, 1);
    first.register().await?;
    let discover = RegistryDiscover::new(zk.clone(), &ServicePath::default(), LoadBalanceKind::RoundRobin);
    let client = Client::builder(discover).service(whoami()).with_retry_interval(Duration::from_millis(10)).build().await?;
    let mut changes = client.discover().watch().expect("registry discovery publishes changes");
    let proxy = client.get_client("Whoami")?;

    assert_eq!(proxy.call("whoami", Args::new()).await?, Value::from("10.0.0.1:9000"));
    assert_eq!(client.pool().stats("Whoami").await, PoolStats { live: 1, idle: 1 });

    // a connection held across a membership change is closed when handed back
    let held = client.pool().borrow("Whoami").await?;
    let second = registrar(&zk, 2);
    second.register().await?;
    assert_eq!(next_change(&mut changes).await?, ["10.0.0.1:9000", "10.0.0.2:9000"]);
    assert_eq!(client.pool().stats("Whoami").await, PoolStats::default());
    client.pool().release(held).await;
    assert_eq!(client.pool().stats("Whoami").await, PoolStats::default());

    // the first server leaves
    first.deregister().await?;
    assert_eq!(next_change(&mut changes).await?, ["10.0.0.2:9000"]);
    for _ in 0..4 {
        assert_eq!(proxy.call("whoami", Args::new()).await?, Value::from("10.0.0.2:9000"));
    }

    second.deregister().await?;
    assert!(next_change(&mut changes).await?.is_empty());
    assert!(client.discover().nodes().await.is_empty());
    assert_eq!(proxy.call("whoami", Args::new()).await, Err(ClientError::NoNodesAvailable));
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn session_expiry_removes_the_node_and_keepalive_brings_it_back() -> anyhow::Result<()> {
    let zk = MemoryCoordinator::new();
    let server_session = zk.new_session();
    let registrar = Arc::new(Registrar::new(server_session.clone(), RegisterConfig::default().with_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)).with_weight(2)));
    registrar.register().await?;
    let keepalive = registrar.spawn_keepalive().expect("memory sessions report events");

    let discover = Arc::new(RegistryDiscover::new(zk.clone(), &ServicePath::default(), LoadBalanceKind::Random));
    let mut changes = discover.watch().expect("registry discovery publishes changes");
    discover.clone().start().await;
    assert_eq!(next_change(&mut changes).await?, ["127.0.0.1:3068"]);
    assert_eq!(discover.select()?.weight, 2);

    server_session.expire_session();
    assert!(next_change(&mut changes).await?.is_empty());
    assert_eq!(discover.select(), Err(ClientError::NoNodesAvailable));

    server_session.restore_session();
    assert_eq!(next_change(&mut changes).await?, ["127.0.0.1:3068"]);

    registrar.stop();
    keepalive.await?;
    discover.stop();
    Ok(())
}

#[tokio::test]
async fn discovery_recovers_after_its_own_session_expires() -> anyhow::Result<()> {
    let zk = MemoryCoordinator::new();
    let path = ServicePath::default();
    zk.ensure_path(&path.parent()).await?;
    let discover = Arc::new(RegistryDiscover::new(zk.clone(), &path, LoadBalanceKind::Random).with_watch_retry_interval(Duration::from_millis(20)));
    let mut changes = discover.watch().expect("registry discovery publishes changes");
    discover.clone().start().await;
    assert!(next_change(&mut changes).await?.is_empty());

    // the watch fires but listing fails until the session is back
    zk.expire_session();
    let server = zk.new_session();
    server.create(&path.leaf(&Node::new("10.0.0.9", 9000, 1)), CreateMode::Ephemeral).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(discover.nodes().await.is_empty());

    zk.restore_session();
    assert_eq!(next_change(&mut changes).await?, ["10.0.0.9:9000"]);
    discover.stop();
    Ok(())
}

#[tokio::test]
async fn invalid_entries_are_skipped() -> anyhow::Result<()> {
    let zk = MemoryCoordinator::new();
    let path = ServicePath::default().with_global_service_name("sms");
    zk.ensure_path(&path.parent()).await?;
    zk.create(&format!("{}/not-a-node", path.parent()), CreateMode::Persistent).await?;
    zk.create(&format!("{}/10.0.0.3:9000:0", path.parent()), CreateMode::Persistent).await?;
    zk.create(&path.leaf(&Node::new("10.0.0.4", 9000, 1)), CreateMode::Persistent).await?;
    let discover = RegistryDiscover::new(zk, &path, LoadBalanceKind::RoundRobin);
    discover.refresh().await?;
    assert_eq!(discover.nodes().await, vec![Arc::new(Node::new("10.0.0.4", 9000, 1))]);
    Ok(())
}
