use async_channel as mpmc;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::{
    client::{FoundValue, Outbound, Result, RpcClient, RpcError},
    config::Config,
    coordinator::Coordinator,
    key::DHTKey,
    message::{
        FindNodeRequest, FindNodeResult, FindValueRequest, FindValueResult, PingRequest, Pong,
        Request, Response, StoreRequest, StoreResult,
    },
    routing::{Contact, NotFoundError, RoutingTable},
    rpc::{InitRpcError, ReqContext, Rpc},
    store::ValueStore,
};

#[derive(Default)]
pub struct KademliaBuilder {
    bootstrap_nodes: Option<Vec<Contact>>,
    address: Option<IpAddr>,
    port: u16,
    id: Option<DHTKey>,
    config: Config,
}

/// Handle to a running node. Clones share the same node.
#[derive(Clone)]
pub struct Kademlia {
    local: Contact,
    config: Config,
    routes: Coordinator,
    store: Arc<ValueStore>,
    outbound: Outbound,
    rpc: Option<Arc<Rpc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    CantInitRpc(#[from] InitRpcError),
}

impl KademliaBuilder {
    pub fn new() -> Self {
        KademliaBuilder::default()
    }

    /// Uses `id` instead of a random identifier.
    pub fn id(&mut self, id: DHTKey) -> &mut Self {
        self.id = Some(id);
        self
    }

    pub fn address(&mut self, address: IpAddr) -> &mut Self {
        self.address = Some(address);
        self
    }

    pub fn port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    pub fn listen(&mut self, addr: SocketAddr) -> &mut Self {
        self.address = Some(addr.ip());
        self.port = addr.port();
        self
    }

    pub fn bootstrap(&mut self, nodes: Vec<Contact>) -> &mut Self {
        self.bootstrap_nodes = Some(nodes);
        self
    }

    pub fn config(&mut self, config: Config) -> &mut Self {
        self.config = config;
        self
    }

    /// Binds the UDP endpoint, starts serving requests and joins the network
    /// through the bootstrap nodes, if any.
    pub async fn start(&mut self) -> std::result::Result<Kademlia, StartError> {
        let address = self.address.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let id = self.id.unwrap_or_else(DHTKey::random);

        let (req_tx, req_rx) = mpsc::channel(1024);
        let rpc = Arc::new(Rpc::new(SocketAddr::new(address, self.port), req_tx).await?);
        let local = Contact::new(id, rpc.get_address());

        info!("new node created {}", local);

        let mut node = Kademlia::with_client(local, rpc.clone(), self.config.clone());
        node.rpc = Some(rpc.clone());
        node.clone().start_req_handler(rpc, req_rx);

        if let Some(bootstrap_nodes) = &self.bootstrap_nodes {
            node.bootstrap(bootstrap_nodes).await;
        }

        Ok(node)
    }
}

impl Kademlia {
    pub fn builder() -> KademliaBuilder {
        KademliaBuilder::new()
    }

    /// Creates a node that talks through `client`. Inbound requests have to
    /// be fed to [Kademlia::handle] by the caller's transport.
    pub fn with_client(local: Contact, client: Arc<dyn RpcClient>, config: Config) -> Kademlia {
        let outbound = Outbound::new(local, client, config.rpc_timeout);
        let routes = Coordinator::spawn(
            RoutingTable::new(local.id, config.k),
            outbound.clone(),
            config.event_queue_len,
        );

        Kademlia {
            local,
            config,
            routes,
            store: Arc::new(ValueStore::new()),
            outbound,
            rpc: None,
        }
    }

    fn start_req_handler(self, rpc: Arc<Rpc>, mut rx: mpsc::Receiver<ReqContext>) {
        tokio::spawn(async move {
            while let Some(req_context) = rx.recv().await {
                let node = self.clone();
                let rpc = rpc.clone();

                tokio::spawn(async move {
                    let rep = node.handle(req_context.get_req().clone()).await;
                    if let Err(e) = rpc.reply(req_context, rep).await {
                        error!("reply send error: {}", e)
                    }
                });
            }

            debug!("channel closed, since sender is dead.");
        });
    }

    pub fn contact(&self) -> &Contact {
        &self.local
    }

    pub fn id(&self) -> &DHTKey {
        &self.local.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Latest routing table snapshot.
    pub fn routes(&self) -> Arc<RoutingTable> {
        self.routes.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn coordinator(&self) -> &Coordinator {
        &self.routes
    }

    pub(crate) fn observe(&self, contact: Contact) {
        self.routes.observe(contact);
    }

    /// Stops the routing table coordinator after it has applied every
    /// queued sighting, and closes the UDP endpoint if there is one.
    pub async fn shutdown(&self) {
        if let Some(rpc) = &self.rpc {
            rpc.close();
        }
        self.routes.shutdown().await;
        info!("node {} shut down", self.local);
    }

    /// Answers one inbound request.
    pub async fn handle(&self, req: Request) -> Response {
        match req {
            Request::Ping(req) => Response::Pong(self.handle_ping(req)),
            Request::Store(req) => Response::Store(self.handle_store(req).await),
            Request::FindNode(req) => Response::FindNode(self.handle_find_node(req)),
            Request::FindValue(req) => Response::FindValue(self.handle_find_value(req).await),
        }
    }

    pub fn handle_ping(&self, req: PingRequest) -> Pong {
        self.observe(req.sender);

        Pong {
            msg_id: req.msg_id,
            sender: self.local,
        }
    }

    pub async fn handle_store(&self, req: StoreRequest) -> StoreResult {
        self.observe(req.sender);
        self.store.insert(req.key, req.value).await;

        StoreResult {
            msg_id: req.msg_id,
            err: None,
        }
    }

    pub fn handle_find_node(&self, req: FindNodeRequest) -> FindNodeResult {
        self.observe(req.sender);

        FindNodeResult {
            msg_id: req.msg_id,
            nodes: self.routes().closest_contacts(&req.target, self.config.k),
            err: None,
        }
    }

    pub async fn handle_find_value(&self, req: FindValueRequest) -> FindValueResult {
        self.observe(req.sender);

        match self.store.get(&req.key).await {
            Some(value) => FindValueResult {
                msg_id: req.msg_id,
                value: Some(value),
                nodes: Vec::new(),
                err: None,
            },
            None => FindValueResult {
                msg_id: req.msg_id,
                value: None,
                nodes: self.routes().closest_contacts(&req.key, self.config.k),
                err: None,
            },
        }
    }

    /// Returns the local contact or a contact from the routing table.
    pub fn find_contact(&self, id: &DHTKey) -> std::result::Result<Contact, NotFoundError> {
        if id == &self.local.id {
            return Ok(self.local);
        }

        self.routes().lookup(id)
    }

    /// Value stored on this node under `key`, without asking anyone.
    pub async fn local_value(&self, key: &DHTKey) -> Option<Vec<u8>> {
        self.store.get(key).await
    }

    /// Pings whatever listens at `addr` and records it as a contact.
    pub async fn ping_addr(&self, addr: SocketAddr) -> Result<Contact> {
        match self.outbound.ping(addr).await {
            Ok(pong) => {
                self.observe(pong.sender);
                Ok(pong.sender)
            }
            Err(err) => {
                debug!("DST {}: Ping req error: {}", addr, err);
                Err(err)
            }
        }
    }

    pub async fn ping(&self, dst: &Contact) -> Result<()> {
        let sender = self.ping_addr(dst.addr).await?;
        if sender.id != dst.id {
            warn!("DST {}: answered ping as {}", dst, sender.id);
        }

        Ok(())
    }

    pub async fn store(&self, dst: &Contact, key: DHTKey, value: Vec<u8>) -> Result<()> {
        let res = self.outbound.store(dst.addr, key, value).await;
        self.record(dst, "Store", &res);
        res
    }

    pub async fn find_node(&self, dst: &Contact, target: &DHTKey) -> Result<Vec<Contact>> {
        let res = self.outbound.find_node(dst.addr, *target).await;
        self.record(dst, "Find node", &res);
        res
    }

    pub async fn find_value(&self, dst: &Contact, key: &DHTKey) -> Result<FoundValue> {
        let res = self.outbound.find_value(dst.addr, *key).await;
        self.record(dst, "Find value", &res);
        res
    }

    /// An answer proves `dst` is alive; silence proves nothing.
    fn record<T>(&self, dst: &Contact, what: &str, res: &Result<T>) {
        match res {
            Ok(_) | Err(RpcError::Rejected(_)) => self.observe(*dst),
            Err(RpcError::Timeout) => debug!("DST {} {}: {} req timeout", dst.addr, dst.id, what),
            Err(err) => debug!("DST {} {}: {} req error: {}", dst.addr, dst.id, what, err),
        }
    }

    /// Runs `job` for every contact with at most `alpha` of them in flight.
    /// Returns the contacts for which `job` succeeded.
    async fn fan_out<F, Fut>(&self, dsts: Vec<Contact>, job: F) -> Vec<Contact>
    where
        F: Fn(Kademlia, Contact) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        if dsts.is_empty() {
            return Vec::new();
        }

        let (jobs_sender, jobs_receiver) = mpmc::unbounded();
        let (results_sender, mut results_receiver) = mpsc::unbounded_channel();

        for _ in 0..self.config.alpha.min(dsts.len()) {
            let jobs: mpmc::Receiver<Contact> = jobs_receiver.clone();
            let results = results_sender.clone();
            let node = self.clone();
            let job = job.clone();
            tokio::spawn(async move {
                while let Ok(dst) = jobs.recv().await {
                    trace!("fan_out: new job: {}", dst);
                    let res = job(node.clone(), dst).await;
                    if results.send((dst, res)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(results_sender);

        for dst in dsts {
            _ = jobs_sender.send(dst).await;
        }
        drop(jobs_sender);

        let mut succeeded = Vec::new();
        while let Some((dst, res)) = results_receiver.recv().await {
            match res {
                Ok(()) => succeeded.push(dst),
                Err(e) => trace!("fan_out: {} failed: {}", dst, e),
            }
        }

        succeeded
    }

    /// Pings every destination. Returns the ones that answered.
    pub async fn ping_slice(&self, dsts: &[Contact]) -> Vec<Contact> {
        self.fan_out(dsts.to_vec(), |node, dst| async move { node.ping(&dst).await })
            .await
    }

    /// Joins the network: pings the seeds, then looks up the local id so that
    /// the buckets near us get populated. Returns the number of seeds that
    /// answered.
    pub async fn bootstrap(&self, seeds: &[Contact]) -> usize {
        let alive = self.ping_slice(seeds).await;
        if alive.is_empty() {
            warn!("none of {} bootstrap nodes answered", seeds.len());
            return 0;
        }

        let found = self.lookup_nodes_from(&self.local.id, &alive).await;
        info!(
            "bootstrapped through {} of {} nodes, {} close nodes found",
            alive.len(),
            seeds.len(),
            found.len()
        );

        alive.len()
    }

    /// Stores `value` on the k nodes closest to `key`. The local node keeps a
    /// copy as well when fewer than k nodes are known. Returns the nodes that
    /// accepted the value.
    pub async fn put(&self, key: DHTKey, value: Vec<u8>) -> Vec<Contact> {
        let candidates = self.lookup_nodes(&key).await;

        if candidates.len() < self.config.k {
            self.store.insert(key, value.clone()).await;
        }

        let value = Arc::new(value);
        let stored = self
            .fan_out(candidates, move |node, dst| {
                let value = value.clone();
                async move { node.store(&dst, key, value.as_ref().clone()).await }
            })
            .await;

        debug!("key {} stored on {} nodes", key, stored.len());
        stored
    }

    /// Looks `key` up locally first, then in the network.
    pub async fn get(&self, key: &DHTKey) -> Option<Vec<u8>> {
        if let Some(v) = self.store.get(key).await {
            return Some(v);
        }

        self.lookup_value(key).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::MemoryNetwork;

    #[tokio::test]
    async fn ping_echoes_id_and_records_sender() {
        let net = MemoryNetwork::new();
        let a = net.spawn_node();
        let b = net.spawn_node();

        let req = PingRequest {
            sender: *b.contact(),
            msg_id: DHTKey::random(),
        };
        let pong = a.handle_ping(req.clone());
        assert_eq!(pong.msg_id, req.msg_id);
        assert_eq!(pong.sender, *a.contact());

        a.routes.shutdown().await;
        assert_eq!(a.routes().lookup(b.id()).unwrap(), *b.contact());
    }

    #[tokio::test]
    async fn store_then_find_value_returns_bytes() {
        let net = MemoryNetwork::new();
        let a = net.spawn_node();
        let b = net.spawn_node();

        let mut bytes = [0u8; crate::KEY_LEN];
        bytes[0] = 0x01;
        let key = DHTKey::from(bytes);

        b.store(a.contact(), key, b"hello".to_vec()).await.unwrap();
        assert_eq!(
            b.find_value(a.contact(), &key).await.unwrap(),
            FoundValue::Value(b"hello".to_vec())
        );
        assert_eq!(a.local_value(&key).await.unwrap(), b"hello");

        let res = a
            .handle_find_value(FindValueRequest {
                sender: *b.contact(),
                msg_id: DHTKey::random(),
                key,
            })
            .await;
        assert_eq!(res.value.as_deref(), Some(&b"hello"[..]));
        assert!(res.nodes.is_empty());
    }

    #[tokio::test]
    async fn find_value_miss_returns_closest_nodes() {
        let net = MemoryNetwork::new();
        let a = net.spawn_node();
        let others = net.spawn_nodes(30);
        for other in &others {
            a.observe(*other.contact());
        }
        a.routes.shutdown().await;

        let key = DHTKey::random();
        let res = a
            .handle_find_value(FindValueRequest {
                sender: *others[0].contact(),
                msg_id: DHTKey::random(),
                key,
            })
            .await;

        assert!(res.value.is_none());
        assert!(!res.nodes.is_empty());
        assert_eq!(res.nodes, a.routes().closest_contacts(&key, a.config.k));
        assert!(res
            .nodes
            .windows(2)
            .all(|w| w[0].id.distance(&key) < w[1].id.distance(&key)));
    }

    #[tokio::test]
    async fn find_node_returns_k_closest() {
        let net = MemoryNetwork::new();
        let a = net.spawn_node();
        let others = net.spawn_nodes(40);
        for other in &others {
            a.observe(*other.contact());
        }
        a.routes.shutdown().await;

        let target = a.routes().contacts().next().unwrap().id;
        let res = a.handle_find_node(FindNodeRequest {
            sender: *others[0].contact(),
            msg_id: DHTKey::random(),
            target,
        });
        assert_eq!(res.nodes.len(), a.routes().len().min(a.config.k));
        assert_eq!(res.nodes[0].id, target);
    }

    #[tokio::test]
    async fn unreachable_peer_is_an_error_not_a_sighting() {
        let net = MemoryNetwork::new();
        let a = net.spawn_node();
        let b = net.spawn_node();
        net.set_down(b.contact(), true);

        assert!(a.ping(b.contact()).await.is_err());
        assert!(a.find_node(b.contact(), &DHTKey::random()).await.is_err());
        a.routes.shutdown().await;
        assert!(a.routes().is_empty());
    }

    #[tokio::test]
    async fn find_contact_knows_self_and_table() {
        let net = MemoryNetwork::new();
        let a = net.spawn_node();
        let b = net.spawn_node();

        assert_eq!(a.find_contact(a.id()).unwrap(), *a.contact());
        assert!(a.find_contact(b.id()).is_err());

        a.ping(b.contact()).await.unwrap();
        a.routes.shutdown().await;
        assert_eq!(a.find_contact(b.id()).unwrap(), *b.contact());
    }

    #[tokio::test]
    async fn ping_slice_reports_responders() {
        let net = MemoryNetwork::new();
        let a = net.spawn_node();
        let others = net.spawn_nodes(5);
        net.set_down(others[1].contact(), true);
        net.set_down(others[3].contact(), true);

        let contacts: Vec<_> = others.iter().map(|n| *n.contact()).collect();
        let mut alive = a.ping_slice(&contacts).await;
        alive.sort_by_key(|c| c.addr);

        let mut expected = vec![contacts[0], contacts[2], contacts[4]];
        expected.sort_by_key(|c| c.addr);
        assert_eq!(alive, expected);
    }
}
