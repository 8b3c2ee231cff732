//! Nodes talking to each other over real UDP sockets on the loopback
//! interface.

use std::time::Duration;

use kademlia::{Config, Contact, DHTKey, FoundValue, Kademlia, RpcError};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn config() -> Config {
    Config::default()
        .rpc_timeout(Duration::from_millis(500))
        .round_timeout(Duration::from_secs(1))
}

async fn start(bootstrap: &[Contact]) -> Kademlia {
    let mut builder = Kademlia::builder();
    builder
        .listen("127.0.0.1:0".parse().unwrap())
        .bootstrap(bootstrap.to_vec())
        .config(config());
    builder.start().await.expect("node failed to start")
}

/// Waits until `node` has `id` in its routing table.
async fn knows(node: &Kademlia, id: &DHTKey) {
    timeout(TEST_TIMEOUT, async {
        while node.find_contact(id).is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("contact never showed up in the routing table");
}

#[tokio::test]
async fn ping_store_and_find_value() {
    let a = start(&[]).await;
    let b = start(&[]).await;
    assert_ne!(a.contact().addr.port(), 0);

    let pong = b.ping_addr(a.contact().addr).await.unwrap();
    assert_eq!(pong, *a.contact());
    knows(&a, b.id()).await;
    knows(&b, a.id()).await;

    let key = DHTKey::hash(b"udp");
    b.store(a.contact(), key, b"over the wire".to_vec())
        .await
        .unwrap();
    assert_eq!(a.local_value(&key).await.unwrap(), b"over the wire");

    assert_eq!(
        b.find_value(a.contact(), &key).await.unwrap(),
        FoundValue::Value(b"over the wire".to_vec())
    );
    match b.find_value(a.contact(), &DHTKey::random()).await.unwrap() {
        FoundValue::Nodes(nodes) => assert_eq!(nodes, vec![*b.contact()]),
        FoundValue::Value(_) => panic!("value for a key nobody stored"),
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn bootstrap_then_iterative_operations() {
    let seed = start(&[]).await;
    let a = start(&[*seed.contact()]).await;
    let b = start(&[*seed.contact()]).await;

    knows(&seed, a.id()).await;
    knows(&seed, b.id()).await;

    let found = timeout(TEST_TIMEOUT, b.lookup_nodes(a.id())).await.unwrap();
    assert_eq!(found.first(), Some(a.contact()));

    let key = DHTKey::hash(b"shared");
    let stored = timeout(TEST_TIMEOUT, a.put(key, b"value".to_vec()))
        .await
        .unwrap();
    assert!(!stored.is_empty());

    let value = timeout(TEST_TIMEOUT, b.get(&key)).await.unwrap();
    assert_eq!(value.unwrap(), b"value");

    seed.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn closed_node_is_unreachable() {
    let a = start(&[]).await;
    let b = start(&[]).await;
    let addr = b.contact().addr;
    b.shutdown().await;

    let err = a.ping_addr(addr).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout | RpcError::Unreachable(_)));

    a.shutdown().await;
    assert_eq!(a.ping_addr(addr).await.unwrap_err(), RpcError::Closed);
}
