use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    fmt::{self, Display, Formatter},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
};

use crate::{
    key::{DHTKey, Distance},
    N_BUCKETS,
};

/// Host alias that resolves to the IPv4 loopback address.
pub const LOCALHOST_ALIAS: &str = "localhost";

/// A peer: its identifier and the address its RPC endpoint listens on.
#[derive(Hash, Eq, PartialEq, Debug, Copy, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: DHTKey,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: DHTKey, addr: SocketAddr) -> Self {
        Contact { id, addr }
    }
}

impl Display for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseAddrError {
    #[error("missing port in address {0:?}")]
    MissingPort(String),
    #[error("invalid port in address {0:?}")]
    InvalidPort(String),
    #[error("invalid host in address {0:?}")]
    InvalidHost(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ParseContactError {
    #[error("contact must look like <id>@<host:port>")]
    MissingSeparator,
    #[error("can't parse node id: {0}")]
    CantParseId(#[from] const_hex::FromHexError),
    #[error(transparent)]
    CantParseAddr(#[from] ParseAddrError),
}

/// Parses a `host:port` string. `localhost` maps to 127.0.0.1 and IPv6 hosts
/// may be wrapped in brackets.
pub fn parse_addr(s: &str) -> Result<SocketAddr, ParseAddrError> {
    let s = s.trim();
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| ParseAddrError::MissingPort(s.to_owned()))?;

    let port: u16 = port
        .parse()
        .map_err(|_| ParseAddrError::InvalidPort(s.to_owned()))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    let ip = if host.eq_ignore_ascii_case(LOCALHOST_ALIAS) {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        host.parse()
            .map_err(|_| ParseAddrError::InvalidHost(s.to_owned()))?
    };

    Ok(SocketAddr::new(ip, port))
}

impl FromStr for Contact {
    type Err = ParseContactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .trim()
            .split_once('@')
            .ok_or(ParseContactError::MissingSeparator)?;

        Ok(Contact {
            id: id.parse()?,
            addr: parse_addr(addr)?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0} not found")]
pub struct NotFoundError(pub DHTKey);

#[derive(Clone, Debug)]
pub struct ContactAndDistance(pub Contact, pub Distance);

impl PartialEq for ContactAndDistance {
    fn eq(&self, other: &ContactAndDistance) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ContactAndDistance {}

impl PartialOrd for ContactAndDistance {
    fn partial_cmp(&self, other: &ContactAndDistance) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Nearest first; equal distances fall back to the raw identifier.
impl Ord for ContactAndDistance {
    fn cmp(&self, other: &ContactAndDistance) -> Ordering {
        self.1.cmp(&other.1).then_with(|| self.0.id.cmp(&other.0.id))
    }
}

/// Contacts sharing one prefix length with the local id. The head is the
/// least recently seen contact, the tail the most recently seen.
#[derive(Clone, Debug, Default)]
pub struct Bucket {
    contacts: VecDeque<Contact>,
}

impl Bucket {
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn head(&self) -> Option<&Contact> {
        self.contacts.front()
    }

    pub fn tail(&self) -> Option<&Contact> {
        self.contacts.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    pub fn get(&self, id: &DHTKey) -> Option<&Contact> {
        self.contacts.iter().find(|c| &c.id == id)
    }

    fn position(&self, id: &DHTKey) -> Option<usize> {
        self.contacts.iter().position(|c| &c.id == id)
    }

    fn move_to_tail(&mut self, pos: usize, contact: Contact) {
        self.contacts.remove(pos);
        self.contacts.push_back(contact);
    }
}

/// Result of offering a sighted contact to the table.
#[derive(Debug, PartialEq, Eq)]
pub enum Touch {
    /// The contact is the local node.
    Local,
    /// Already known; moved to the tail.
    Refreshed,
    /// Appended to a bucket with room.
    Inserted,
    /// The bucket is full; `oldest` has to be pinged before anything changes.
    Full { index: usize, oldest: Contact },
}

/// Array of [N_BUCKETS] buckets indexed by shared-prefix length.
///
/// Buckets are reference counted so that cloning the table to publish a
/// snapshot is cheap; only the bucket touched by the next mutation is copied.
#[derive(Clone, Debug)]
pub struct RoutingTable {
    local_id: DHTKey,
    k: usize,
    buckets: Vec<Arc<Bucket>>,
}

impl RoutingTable {
    pub fn new(local_id: DHTKey, k: usize) -> RoutingTable {
        RoutingTable {
            local_id,
            k,
            buckets: vec![Arc::new(Bucket::default()); N_BUCKETS],
        }
    }

    pub fn local_id(&self) -> &DHTKey {
        &self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Index of the bucket that would hold `id`, or [None] for the local id.
    #[inline]
    pub fn bucket_index(&self, id: &DHTKey) -> Option<usize> {
        let index = self.local_id.shared_prefix_len(id);
        (index < N_BUCKETS).then_some(index)
    }

    pub fn bucket(&self, index: usize) -> Option<&Bucket> {
        self.buckets.get(index).map(|b| b.as_ref())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.iter().flat_map(|b| b.iter())
    }

    /// Applies the first two steps of the eviction policy. A full bucket is
    /// left untouched and reported back so the caller can ping its head.
    pub(crate) fn touch(&mut self, contact: Contact) -> Touch {
        let Some(index) = self.bucket_index(&contact.id) else {
            return Touch::Local;
        };

        let (pos, len) = {
            let bucket = &self.buckets[index];
            (bucket.position(&contact.id), bucket.len())
        };

        match pos {
            Some(pos) => {
                Arc::make_mut(&mut self.buckets[index]).move_to_tail(pos, contact);
                Touch::Refreshed
            }
            None if len < self.k => {
                Arc::make_mut(&mut self.buckets[index])
                    .contacts
                    .push_back(contact);
                Touch::Inserted
            }
            None => match self.buckets[index].head() {
                Some(oldest) => Touch::Full {
                    index,
                    oldest: *oldest,
                },
                // k == 0
                None => Touch::Local,
            },
        }
    }

    /// Moves `id` to the tail of its bucket if it is still there.
    pub(crate) fn refresh(&mut self, id: &DHTKey) -> bool {
        let Some(index) = self.bucket_index(id) else {
            return false;
        };

        match self.buckets[index].position(id) {
            Some(pos) => {
                let bucket = Arc::make_mut(&mut self.buckets[index]);
                let contact = bucket.contacts[pos];
                bucket.move_to_tail(pos, contact);
                true
            }
            None => false,
        }
    }

    /// Drops `evicted` from its bucket and appends `contact` if there is room
    /// and it isn't already present. Returns whether `contact` was inserted.
    pub(crate) fn replace(&mut self, evicted: &DHTKey, contact: Contact) -> bool {
        let Some(index) = self.bucket_index(&contact.id) else {
            return false;
        };

        let k = self.k;
        let bucket = Arc::make_mut(&mut self.buckets[index]);
        if let Some(pos) = bucket.position(evicted) {
            bucket.contacts.remove(pos);
        }

        if bucket.position(&contact.id).is_some() || bucket.len() >= k {
            return false;
        }

        bucket.contacts.push_back(contact);
        true
    }

    #[cfg(test)]
    pub(crate) fn remove(&mut self, id: &DHTKey) -> Option<Contact> {
        let index = self.bucket_index(id)?;
        let pos = self.buckets[index].position(id)?;
        Arc::make_mut(&mut self.buckets[index]).contacts.remove(pos)
    }

    /// Exact lookup of a contact by identifier.
    pub fn lookup(&self, id: &DHTKey) -> Result<Contact, NotFoundError> {
        self.bucket_index(id)
            .and_then(|index| self.buckets[index].get(id))
            .copied()
            .ok_or(NotFoundError(*id))
    }

    /// Returns at most `count` contacts ordered by distance to `target`,
    /// nearest first.
    pub fn closest(&self, target: &DHTKey, count: usize) -> Vec<ContactAndDistance> {
        if count == 0 {
            return Vec::new();
        }

        // max-heap holding the `count` nearest seen so far
        let mut heap: BinaryHeap<ContactAndDistance> = BinaryHeap::with_capacity(count + 1);
        for contact in self.contacts() {
            let entry = ContactAndDistance(*contact, contact.id.distance(target));
            if heap.len() < count {
                heap.push(entry);
            } else if heap.peek().is_some_and(|farthest| entry < *farthest) {
                heap.pop();
                heap.push(entry);
            }
        }

        heap.into_sorted_vec()
    }

    pub fn closest_contacts(&self, target: &DHTKey, count: usize) -> Vec<Contact> {
        self.closest(target, count)
            .into_iter()
            .map(|ContactAndDistance(contact, _)| contact)
            .collect()
    }
}
