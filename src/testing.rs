//! In-process network for tests: requests are handed straight to the
//! destination node's handler instead of going through a socket.

use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU16, AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use crate::{
    client::{Result, RpcClient, RpcError},
    config::Config,
    kademlia::Kademlia,
    key::DHTKey,
    message::{Request, Response},
    routing::Contact,
};

#[derive(Default)]
struct Inner {
    nodes: Mutex<HashMap<SocketAddr, Kademlia>>,
    down: Mutex<HashSet<SocketAddr>>,
    silent: Mutex<HashSet<SocketAddr>>,
    next_host: AtomicU16,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryNetwork {
    inner: Arc<Inner>,
}

/// What a node uses to reach the network. Holds it weakly, since the network
/// holds the node.
struct Link(Weak<Inner>);

/// Counts a call as in flight until it returns or is cancelled.
struct InFlight(Arc<Inner>);

impl InFlight {
    fn enter(net: Arc<Inner>) -> Self {
        let now = net.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        net.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(net)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryNetwork {
    pub(crate) fn new() -> Self {
        MemoryNetwork::default()
    }

    /// Short timeouts so that tests with unresponsive nodes stay fast.
    pub(crate) fn config() -> Config {
        Config::default()
            .rpc_timeout(Duration::from_millis(100))
            .round_timeout(Duration::from_millis(200))
    }

    pub(crate) fn spawn_node(&self) -> Kademlia {
        self.spawn_node_with_id(DHTKey::random())
    }

    pub(crate) fn spawn_node_with_id(&self, id: DHTKey) -> Kademlia {
        let host = self.inner.next_host.fetch_add(1, Ordering::Relaxed);
        let [hi, lo] = host.to_be_bytes();
        let addr = SocketAddr::from(([10, 0, hi, lo], 4000));

        let link = Arc::new(Link(Arc::downgrade(&self.inner)));
        let node = Kademlia::with_client(Contact::new(id, addr), link, Self::config());
        self.inner
            .nodes
            .lock()
            .unwrap()
            .insert(addr, node.clone());
        node
    }

    pub(crate) fn spawn_nodes(&self, n: usize) -> Vec<Kademlia> {
        (0..n).map(|_| self.spawn_node()).collect()
    }

    /// A down node fails every call immediately.
    pub(crate) fn set_down(&self, contact: &Contact, down: bool) {
        let mut set = self.inner.down.lock().unwrap();
        if down {
            set.insert(contact.addr);
        } else {
            set.remove(&contact.addr);
        }
    }

    pub(crate) fn is_down(&self, contact: &Contact) -> bool {
        self.inner.down.lock().unwrap().contains(&contact.addr)
    }

    /// A silent node never answers; callers only get out through a timeout.
    pub(crate) fn set_silent(&self, contact: &Contact, silent: bool) {
        let mut set = self.inner.silent.lock().unwrap();
        if silent {
            set.insert(contact.addr);
        } else {
            set.remove(&contact.addr);
        }
    }

    /// Number of calls delivered so far, failed ones included.
    pub(crate) fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Most calls ever outstanding at the same time.
    pub(crate) fn peak_in_flight(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_stats(&self) {
        self.inner.calls.store(0, Ordering::SeqCst);
        self.inner
            .peak
            .store(self.inner.in_flight.load(Ordering::SeqCst), Ordering::SeqCst);
    }
}

#[async_trait]
impl RpcClient for Link {
    async fn call(&self, addr: SocketAddr, req: Request) -> Result<Response> {
        let Some(net) = self.0.upgrade() else {
            return Err(RpcError::Closed);
        };
        net.calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(net.clone());

        if net.down.lock().unwrap().contains(&addr) {
            return Err(RpcError::Unreachable(addr.to_string()));
        }
        if net.silent.lock().unwrap().contains(&addr) {
            return std::future::pending().await;
        }

        let node = net.nodes.lock().unwrap().get(&addr).cloned();
        match node {
            Some(node) => Ok(node.handle(req).await),
            None => Err(RpcError::Unreachable(addr.to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn calls_reach_the_addressed_node() {
        let net = MemoryNetwork::new();
        let a = net.spawn_node();
        let b = net.spawn_node();
        assert_ne!(a.contact().addr, b.contact().addr);

        assert_eq!(a.ping_addr(b.contact().addr).await.unwrap(), *b.contact());
        assert_eq!(net.calls(), 1);

        net.set_down(b.contact(), true);
        assert!(a.ping(b.contact()).await.is_err());
        net.set_down(b.contact(), false);
        assert!(a.ping(b.contact()).await.is_ok());

        net.set_silent(b.contact(), true);
        assert_eq!(a.ping(b.contact()).await, Err(RpcError::Timeout));

        // the timed-out call was cancelled and no longer counts
        assert_eq!(net.peak_in_flight(), 1);
        net.reset_stats();
        assert_eq!((net.calls(), net.peak_in_flight()), (0, 0));
    }
}
