mod client;
mod config;
mod coordinator;
mod kademlia;
mod key;
mod lookup;
mod message;
mod routing;
mod rpc;
mod store;

#[cfg(test)]
mod testing;

pub use client::{FoundValue, Outbound, RpcClient, RpcError};
pub use config::Config;
pub use kademlia::{Kademlia, KademliaBuilder, StartError};
pub use key::{DHTKey, Distance};
pub use lookup::{LookupKind, LookupOutcome};
pub use message::{
    FindNodeRequest, FindNodeResult, FindValueRequest, FindValueResult, PingRequest, Pong,
    Request, Response, StoreRequest, StoreResult,
};
pub use routing::{
    parse_addr, Bucket, Contact, NotFoundError, ParseAddrError, ParseContactError, RoutingTable,
};
pub use rpc::{InitRpcError, ReqContext, Rpc, RpcMessage, SendMsgError};
pub use store::ValueStore;

/// Length of key in bytes
pub const KEY_LEN: usize = 20;
/// Number of buckets
pub const N_BUCKETS: usize = KEY_LEN * 8;
/// Entries per bucket
pub const K_PARAM: usize = 20;
/// Max message length
pub const MESSAGE_LEN: usize = 8196;
/// Default rpc timeout in milliseconds
pub const TIMEOUT: u64 = 5000;
/// Default lookup round timeout in milliseconds
pub const ROUND_TIMEOUT: u64 = 6000;
/// Number of parallel requests
pub const A_PARAM: usize = 3;
/// Default capacity of the routing table event queue
pub const EVENT_QUEUE_LEN: usize = 1024;
