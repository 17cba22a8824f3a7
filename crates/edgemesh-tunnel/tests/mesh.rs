//! End-to-end scenarios: one relay server and edge agents on loopback

use edgemesh_tunnel::{
    AddressDirectory, Establisher, MeshNode, MemoryBackend, Role, StaticCertManager, TunnelConfig,
    SERVER_ADDR_NAME,
};
use edgemesh_tunnel_core::MultiaddrExt;
use edgemesh_tunnel_net::KeyPair;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

type Directory = Arc<AddressDirectory<MemoryBackend>>;

fn on_loopback(mut config: TunnelConfig) -> TunnelConfig {
    config.listen_ip = "127.0.0.1".parse().unwrap();
    config.listen_port = 0;
    config.relay_poll_interval = Duration::from_millis(50);
    config.republish_interval = Duration::ZERO;
    config
}

async fn bring_up(config: TunnelConfig, directory: &Directory) -> MeshNode<MemoryBackend> {
    let establisher = Establisher::new(
        config,
        directory.clone(),
        Arc::new(StaticCertManager::new(KeyPair::generate())),
        CancellationToken::new(),
    );
    tokio::time::timeout(Duration::from_secs(10), establisher.bring_up())
        .await
        .expect("bring-up timed out")
        .expect("bring-up failed")
}

async fn start_server(directory: &Directory) -> MeshNode<MemoryBackend> {
    bring_up(on_loopback(TunnelConfig::server("cloud-1")), directory).await
}

async fn start_agent(directory: &Directory, name: &str, hole_punching: bool) -> MeshNode<MemoryBackend> {
    let mut config = on_loopback(TunnelConfig::agent(name));
    config.role = Role::Agent {
        enable_hole_punching: hole_punching,
    };
    bring_up(config, directory).await
}

/// Publish only the relay-circuit addresses of `node` under `name`
async fn publish_relayed_only(directory: &Directory, name: &str, node: &MeshNode<MemoryBackend>) {
    let relayed: Vec<_> = node
        .published
        .iter()
        .filter(|a| a.is_relayed())
        .cloned()
        .collect();
    assert!(!relayed.is_empty());
    directory.set(name, node.host.peer_id(), &relayed).await.unwrap();
}

async fn echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = tcp.into_split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr.to_string()
}

async fn echo<S>(stream: S, payload: &[u8]) -> Vec<u8>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let owned = payload.to_vec();
    let writer = tokio::spawn(async move {
        wr.write_all(&owned).await.unwrap();
        wr.shutdown().await.unwrap();
    });
    let mut out = Vec::new();
    rd.read_to_end(&mut out).await.unwrap();
    writer.await.unwrap();
    out
}

#[tokio::test]
async fn test_bring_up_publishes_relay_circuit() {
    let directory: Directory = Arc::new(AddressDirectory::new(MemoryBackend::new()));
    let server = start_server(&directory).await;
    let agent = start_agent(&directory, "edge-a", false).await;

    let server_record = directory.get(SERVER_ADDR_NAME).await.unwrap();
    assert_eq!(server_record.id, server.host.peer_id());

    let record = directory.get("edge-a").await.unwrap();
    assert_eq!(record.id, agent.host.peer_id());
    let circuit = record
        .addrs
        .iter()
        .find(|a| a.is_relayed())
        .expect("agent record carries a relay circuit");
    let (_, relay) = circuit.relay().unwrap();
    assert_eq!(relay, server.host.peer_id());

    let stats = server.host.relay_stats().unwrap();
    assert_eq!(stats.active_reservations, 1);
}

#[tokio::test]
async fn test_dial_through_relay_only_record() {
    let directory: Directory = Arc::new(AddressDirectory::new(MemoryBackend::new()));
    let server = start_server(&directory).await;
    let a = start_agent(&directory, "edge-a", false).await;
    let b = start_agent(&directory, "edge-b", false).await;
    publish_relayed_only(&directory, "edge-b-relayed", &b).await;
    let target = echo_server().await;

    let proxy = a.proxy.as_ref().unwrap();
    let stream = proxy.open("edge-b-relayed", &target).await.unwrap();
    assert!(stream.is_relayed());
    assert_eq!(stream.remote_peer(), b.host.peer_id());
    assert_eq!(echo(stream, b"through the relay").await, b"through the relay");

    assert!(!a.host.has_direct_connection(&b.host.peer_id()));
    assert!(server.host.relay_stats().unwrap().circuits_opened >= 1);
}

#[tokio::test]
async fn test_relayed_streams_are_isolated() {
    let directory: Directory = Arc::new(AddressDirectory::new(MemoryBackend::new()));
    let _server = start_server(&directory).await;
    let a = start_agent(&directory, "edge-a", false).await;
    let b = start_agent(&directory, "edge-b", false).await;
    publish_relayed_only(&directory, "edge-b-relayed", &b).await;
    let target = echo_server().await;

    let proxy = a.proxy.clone().unwrap();
    let mut tasks = Vec::new();
    for i in 0..4u8 {
        let proxy = proxy.clone();
        let target = target.clone();
        tasks.push(tokio::spawn(async move {
            let stream = proxy.open("edge-b-relayed", &target).await.unwrap();
            let payload = vec![i; 64 * 1024 + i as usize];
            echo(stream, &payload).await == payload
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap());
    }

    // all of them shared one relayed connection
    assert_eq!(a.host.connections(&b.host.peer_id()).len(), 1);
}

#[tokio::test]
async fn test_forward_survives_peer_stream_teardown() {
    let directory: Directory = Arc::new(AddressDirectory::new(MemoryBackend::new()));
    let _server = start_server(&directory).await;
    let a = start_agent(&directory, "edge-a", false).await;
    let b = start_agent(&directory, "edge-b", false).await;
    publish_relayed_only(&directory, "edge-b-relayed", &b).await;
    let target = echo_server().await;

    let proxy = a.proxy.as_ref().unwrap();
    let mut doomed = proxy.open("edge-b-relayed", &target).await.unwrap();
    let survivor = proxy.open("edge-b-relayed", &target).await.unwrap();

    doomed.reset();
    assert_eq!(echo(survivor, b"unaffected").await, b"unaffected");
}

#[tokio::test]
async fn test_hole_punch_upgrades_relayed_connection() {
    let directory: Directory = Arc::new(AddressDirectory::new(MemoryBackend::new()));
    let _server = start_server(&directory).await;
    let a = start_agent(&directory, "edge-a", true).await;
    let b = start_agent(&directory, "edge-b", true).await;
    publish_relayed_only(&directory, "edge-b-relayed", &b).await;
    let target = echo_server().await;

    let proxy = a.proxy.as_ref().unwrap();
    let relayed = proxy.open("edge-b-relayed", &target).await.unwrap();
    assert!(relayed.is_relayed());

    let peer = b.host.peer_id();
    let upgraded = tokio::time::timeout(Duration::from_secs(10), async {
        while !a.host.has_direct_connection(&peer) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(upgraded.is_ok(), "no direct connection after hole punch");

    // the relayed stream keeps working and new streams go direct
    assert_eq!(echo(relayed, b"old path").await, b"old path");
    let direct = proxy.open("edge-b-relayed", &target).await.unwrap();
    assert!(!direct.is_relayed());
    assert_eq!(echo(direct, b"new path").await, b"new path");
}
