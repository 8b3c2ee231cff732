use serde::{Deserialize, Serialize};

use crate::{key::DHTKey, routing::Contact};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub sender: Contact,
    pub msg_id: DHTKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub msg_id: DHTKey,
    pub sender: Contact,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRequest {
    pub sender: Contact,
    pub msg_id: DHTKey,
    pub key: DHTKey,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreResult {
    pub msg_id: DHTKey,
    pub err: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodeRequest {
    pub sender: Contact,
    pub msg_id: DHTKey,
    pub target: DHTKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodeResult {
    pub msg_id: DHTKey,
    pub nodes: Vec<Contact>,
    pub err: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindValueRequest {
    pub sender: Contact,
    pub msg_id: DHTKey,
    pub key: DHTKey,
}

/// When `value` is set, `nodes` carries no meaning and is left empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindValueResult {
    pub msg_id: DHTKey,
    pub value: Option<Vec<u8>>,
    pub nodes: Vec<Contact>,
    pub err: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Ping(PingRequest),
    Store(StoreRequest),
    FindNode(FindNodeRequest),
    FindValue(FindValueRequest),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Pong(Pong),
    Store(StoreResult),
    FindNode(FindNodeResult),
    FindValue(FindValueResult),
}

impl Request {
    pub fn ping(sender: Contact) -> Self {
        Request::Ping(PingRequest {
            sender,
            msg_id: DHTKey::random(),
        })
    }

    pub fn store(sender: Contact, key: DHTKey, value: Vec<u8>) -> Self {
        Request::Store(StoreRequest {
            sender,
            msg_id: DHTKey::random(),
            key,
            value,
        })
    }

    pub fn find_node(sender: Contact, target: DHTKey) -> Self {
        Request::FindNode(FindNodeRequest {
            sender,
            msg_id: DHTKey::random(),
            target,
        })
    }

    pub fn find_value(sender: Contact, key: DHTKey) -> Self {
        Request::FindValue(FindValueRequest {
            sender,
            msg_id: DHTKey::random(),
            key,
        })
    }

    pub fn msg_id(&self) -> &DHTKey {
        match self {
            Request::Ping(r) => &r.msg_id,
            Request::Store(r) => &r.msg_id,
            Request::FindNode(r) => &r.msg_id,
            Request::FindValue(r) => &r.msg_id,
        }
    }

    pub fn sender(&self) -> &Contact {
        match self {
            Request::Ping(r) => &r.sender,
            Request::Store(r) => &r.sender,
            Request::FindNode(r) => &r.sender,
            Request::FindValue(r) => &r.sender,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::Ping(_) => "ping",
            Request::Store(_) => "store",
            Request::FindNode(_) => "find_node",
            Request::FindValue(_) => "find_value",
        }
    }
}

impl Response {
    pub fn msg_id(&self) -> &DHTKey {
        match self {
            Response::Pong(r) => &r.msg_id,
            Response::Store(r) => &r.msg_id,
            Response::FindNode(r) => &r.msg_id,
            Response::FindValue(r) => &r.msg_id,
        }
    }

    /// Whether this is the response kind `req` expects and echoes its id.
    pub fn answers(&self, req: &Request) -> bool {
        let same_kind = matches!(
            (req, self),
            (Request::Ping(_), Response::Pong(_))
                | (Request::Store(_), Response::Store(_))
                | (Request::FindNode(_), Response::FindNode(_))
                | (Request::FindValue(_), Response::FindValue(_))
        );

        same_kind && self.msg_id() == req.msg_id()
    }
}
