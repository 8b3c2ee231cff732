use async_trait::async_trait;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::trace;

use crate::{
    key::DHTKey,
    message::{Pong, Request, Response},
    routing::Contact,
};

/// Why an outbound call produced no usable answer. Apart from `Rejected`,
/// every variant means the peer can't currently be considered live.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("request has timed out")]
    Timeout,
    #[error("peer is unreachable: {0}")]
    Unreachable(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("peer rejected request: {0}")]
    Rejected(String),
    #[error("transport is closed")]
    Closed,
}

pub type Result<T> = core::result::Result<T, RpcError>;

/// Capability to deliver a request to the RPC endpoint at `addr` and wait for
/// its response. Implementations don't need to enforce a timeout.
#[async_trait]
pub trait RpcClient: Send + Sync + 'static {
    async fn call(&self, addr: SocketAddr, req: Request) -> Result<Response>;
}

/// Outcome of a FindValue call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FoundValue {
    Value(Vec<u8>),
    Nodes(Vec<Contact>),
}

/// Issues typed calls on behalf of the local node, bounded by a timeout.
#[derive(Clone)]
pub struct Outbound {
    local: Contact,
    client: Arc<dyn RpcClient>,
    timeout: Duration,
}

impl Outbound {
    pub fn new(local: Contact, client: Arc<dyn RpcClient>, timeout: Duration) -> Self {
        Outbound {
            local,
            client,
            timeout,
        }
    }

    pub fn local(&self) -> &Contact {
        &self.local
    }

    async fn call(&self, addr: SocketAddr, req: Request) -> Result<Response> {
        trace!("| OUT | {} {} ==> {}", req.kind(), req.msg_id(), addr);

        let rep = tokio::time::timeout(self.timeout, self.client.call(addr, req.clone()))
            .await
            .map_err(|_| RpcError::Timeout)??;

        if !rep.answers(&req) {
            return Err(RpcError::Malformed(format!(
                "{} reply from {} doesn't answer request {}",
                req.kind(),
                addr,
                req.msg_id()
            )));
        }

        Ok(rep)
    }

    pub async fn ping(&self, addr: SocketAddr) -> Result<Pong> {
        match self.call(addr, Request::ping(self.local)).await? {
            Response::Pong(pong) => Ok(pong),
            rep => Err(unexpected(&rep)),
        }
    }

    pub async fn store(&self, addr: SocketAddr, key: DHTKey, value: Vec<u8>) -> Result<()> {
        match self.call(addr, Request::store(self.local, key, value)).await? {
            Response::Store(res) => match res.err {
                Some(err) => Err(RpcError::Rejected(err)),
                None => Ok(()),
            },
            rep => Err(unexpected(&rep)),
        }
    }

    pub async fn find_node(&self, addr: SocketAddr, target: DHTKey) -> Result<Vec<Contact>> {
        match self.call(addr, Request::find_node(self.local, target)).await? {
            Response::FindNode(res) => match res.err {
                Some(err) => Err(RpcError::Rejected(err)),
                None => Ok(res.nodes),
            },
            rep => Err(unexpected(&rep)),
        }
    }

    pub async fn find_value(&self, addr: SocketAddr, key: DHTKey) -> Result<FoundValue> {
        match self.call(addr, Request::find_value(self.local, key)).await? {
            Response::FindValue(res) => match (res.err, res.value) {
                (Some(err), _) => Err(RpcError::Rejected(err)),
                (None, Some(value)) => Ok(FoundValue::Value(value)),
                (None, None) => Ok(FoundValue::Nodes(res.nodes)),
            },
            rep => Err(unexpected(&rep)),
        }
    }
}

fn unexpected(rep: &Response) -> RpcError {
    RpcError::Malformed(format!("unexpected reply {}", rep.msg_id()))
}
