use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    client::{self, RpcClient, RpcError},
    key::DHTKey,
    message::{Request, Response},
    MESSAGE_LEN,
};

/// Datagram payload, encoded with MessagePack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcMessage {
    Request(Request),
    Response(Response),
}

/// An inbound request together with the address to answer.
#[derive(Debug)]
pub struct ReqContext {
    req: Request,
    src: SocketAddr,
}

impl ReqContext {
    pub fn get_req(&self) -> &Request {
        &self.req
    }
}

#[derive(Debug, thiserror::Error)]
#[error("can't bind udp socket: {0}")]
pub struct InitRpcError(#[from] io::Error);

#[derive(Debug, thiserror::Error)]
pub enum SendMsgError {
    #[error("can't encode message: {0}")]
    CantEncode(#[from] rmp_serde::encode::Error),
    #[error("message of {0} bytes exceeds {max} bytes", max = MESSAGE_LEN)]
    TooLong(usize),
    #[error("can't send datagram: {0}")]
    Io(#[from] io::Error),
}

type Pending = scc::HashMap<DHTKey, oneshot::Sender<Response>>;

/// UDP endpoint: answers incoming requests through the channel given to
/// [Rpc::new] and implements [RpcClient] for outgoing ones.
pub struct Rpc {
    socket: Arc<UdpSocket>,
    pending: Arc<Pending>,
    address: SocketAddr,
    listener: JoinHandle<()>,
    closed: AtomicBool,
}

/// Removes a pending call when its caller goes away, e.g. on timeout.
struct PendingGuard<'a> {
    pending: &'a Pending,
    token: DHTKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.token);
    }
}

impl Rpc {
    /// Binds `addr` and starts the receive loop.
    pub async fn new(
        addr: SocketAddr,
        req_tx: mpsc::Sender<ReqContext>,
    ) -> Result<Rpc, InitRpcError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let address = socket.local_addr()?;
        let pending: Arc<Pending> = Arc::new(scc::HashMap::new());

        let listener = tokio::spawn(Self::listen(socket.clone(), pending.clone(), req_tx));

        info!("rpc listening on {}", address);

        Ok(Rpc {
            socket,
            pending,
            address,
            listener,
            closed: AtomicBool::new(false),
        })
    }

    pub fn get_address(&self) -> SocketAddr {
        self.address
    }

    async fn listen(
        socket: Arc<UdpSocket>,
        pending: Arc<Pending>,
        req_tx: mpsc::Sender<ReqContext>,
    ) {
        let mut buf = vec![0u8; MESSAGE_LEN];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("can't receive datagram: {}", e);
                    continue;
                }
            };

            let msg: RpcMessage = match rmp_serde::from_slice(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("{}: malformed message, ignoring: {}", src, e);
                    continue;
                }
            };

            match msg {
                RpcMessage::Request(req) => {
                    trace!("|  IN | {} {} <== {}", req.kind(), req.msg_id(), src);
                    if req_tx.send(ReqContext { req, src }).await.is_err() {
                        info!("Closing channel, since receiver is dead.");
                        break;
                    }
                }
                RpcMessage::Response(rep) => match pending.remove_async(rep.msg_id()).await {
                    Some((_, tx)) => {
                        _ = tx.send(rep);
                    }
                    None => warn!("{}: unsolicited reply received, ignoring.", src),
                },
            }
        }
    }

    async fn send_msg(&self, msg: &RpcMessage, addr: SocketAddr) -> Result<(), SendMsgError> {
        let enc_msg = rmp_serde::to_vec(msg)?;
        if enc_msg.len() > MESSAGE_LEN {
            return Err(SendMsgError::TooLong(enc_msg.len()));
        }

        self.socket.send_to(&enc_msg, addr).await?;
        Ok(())
    }

    pub async fn reply(&self, ctx: ReqContext, rep: Response) -> Result<(), SendMsgError> {
        trace!("| OUT | reply {} ==> {}", rep.msg_id(), ctx.src);
        self.send_msg(&RpcMessage::Response(rep), ctx.src).await
    }

    /// Stops the receive loop. Calls in flight end with [RpcError::Closed].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.listener.abort();
        self.pending.clear();
        debug!("rpc on {} closed", self.address);
    }
}

impl Drop for Rpc {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl RpcClient for Rpc {
    async fn call(&self, addr: SocketAddr, req: Request) -> client::Result<Response> {
        if self.closed.load(Ordering::Acquire) || self.listener.is_finished() {
            return Err(RpcError::Closed);
        }

        let token = *req.msg_id();
        let (tx, rx) = oneshot::channel();
        if self.pending.insert_async(token, tx).await.is_err() {
            return Err(RpcError::Malformed(format!("message id {} already in flight", token)));
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            token,
        };

        self.send_msg(&RpcMessage::Request(req), addr)
            .await
            .map_err(|e| match e {
                SendMsgError::Io(e) => RpcError::Unreachable(format!("{}: {}", addr, e)),
                e => RpcError::Malformed(e.to_string()),
            })?;

        rx.await.map_err(|_| RpcError::Closed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{message::Pong, routing::Contact};
    use std::time::Duration;

    async fn endpoint() -> (Rpc, mpsc::Receiver<ReqContext>) {
        let (tx, rx) = mpsc::channel(16);
        let rpc = Rpc::new("127.0.0.1:0".parse().unwrap(), tx).await.unwrap();
        (rpc, rx)
    }

    #[tokio::test]
    async fn request_and_reply_round_trip() {
        let (server, mut requests) = endpoint().await;
        let (client, _) = endpoint().await;
        let server_contact = Contact::new(DHTKey::random(), server.get_address());

        tokio::spawn(async move {
            let ctx = requests.recv().await.unwrap();
            let pong = Pong {
                msg_id: *ctx.get_req().msg_id(),
                sender: server_contact,
            };
            server.reply(ctx, Response::Pong(pong)).await.unwrap();
        });

        let me = Contact::new(DHTKey::random(), client.get_address());
        let req = Request::ping(me);
        let rep = tokio::time::timeout(
            Duration::from_secs(2),
            client.call(server_contact.addr, req.clone()),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(rep.answers(&req));
        assert!(client.pending.is_empty());
    }

    #[tokio::test]
    async fn garbage_is_dropped_and_listener_survives() {
        let (server, mut requests) = endpoint().await;
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(b"definitely not msgpack", server.get_address())
            .await
            .unwrap();

        let (client, _) = endpoint().await;
        let req = Request::ping(Contact::new(DHTKey::random(), client.get_address()));
        let msg_id = *req.msg_id();
        tokio::spawn(async move {
            _ = client.call(server.get_address(), req).await;
        });

        let ctx = tokio::time::timeout(Duration::from_secs(2), requests.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.get_req().msg_id(), &msg_id);
    }

    #[tokio::test]
    async fn oversized_request_is_refused() {
        let (rpc, _requests) = endpoint().await;
        let me = Contact::new(DHTKey::random(), rpc.get_address());
        let req = Request::store(me, DHTKey::random(), vec![7; MESSAGE_LEN * 2]);

        let err = rpc.call(rpc.get_address(), req).await.unwrap_err();
        assert!(matches!(err, RpcError::Malformed(_)));
        assert!(rpc.pending.is_empty());
    }

    #[tokio::test]
    async fn closed_endpoint_refuses_calls() {
        let (rpc, _requests) = endpoint().await;
        rpc.close();

        let req = Request::ping(Contact::new(DHTKey::random(), rpc.get_address()));
        assert_eq!(rpc.call(rpc.get_address(), req).await, Err(RpcError::Closed));
    }
}
