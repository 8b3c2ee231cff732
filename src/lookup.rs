//! Iterative lookup: repeatedly asks the closest not-yet-queried contacts for
//! contacts even closer to a target until no progress is made.

use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::{
    client::{FoundValue, Result},
    kademlia::Kademlia,
    key::{DHTKey, Distance},
    routing::{Contact, ContactAndDistance},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupKind {
    /// FindNode: converge on the k closest contacts.
    Node,
    /// FindValue: stop at the first node holding the value.
    Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LookupState {
    Init,
    Probing,
    Converged,
    ValueFound,
    Done,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupOutcome {
    Nodes(Vec<Contact>),
    Value(Vec<u8>),
    NotFound,
}

struct Lookup {
    node: Kademlia,
    target: DHTKey,
    kind: LookupKind,
    state: LookupState,
    /// Known contacts that haven't been asked yet.
    candidates: BTreeSet<ContactAndDistance>,
    /// Every id ever added to `candidates`, plus the local one.
    seen: HashSet<DHTKey>,
    queried: HashSet<DHTKey>,
    failed: HashSet<DHTKey>,
    /// Contacts learned from answers that haven't failed, nearest first.
    /// The first k of them are the result once they have all answered.
    closest: BTreeSet<ContactAndDistance>,
    /// Set once progress stops; from then on only the unqueried members of
    /// the k best are asked.
    finishing: bool,
    rounds: usize,
}

enum Round {
    Value(Vec<u8>),
    Nodes { answered: usize },
}

impl Lookup {
    fn new(node: Kademlia, target: DHTKey, kind: LookupKind) -> Self {
        let mut seen = HashSet::new();
        seen.insert(*node.id());

        Lookup {
            node,
            target,
            kind,
            state: LookupState::Init,
            candidates: BTreeSet::new(),
            seen,
            queried: HashSet::new(),
            failed: HashSet::new(),
            closest: BTreeSet::new(),
            finishing: false,
            rounds: 0,
        }
    }

    fn k(&self) -> usize {
        self.node.config().k
    }

    fn alpha(&self) -> usize {
        self.node.config().alpha
    }

    fn entry(&self, contact: Contact) -> ContactAndDistance {
        ContactAndDistance(contact, contact.id.distance(&self.target))
    }

    /// Queues `contact` unless this lookup has already seen it.
    fn add_candidate(&mut self, contact: Contact) -> bool {
        if !self.seen.insert(contact.id) {
            return false;
        }

        let entry = self.entry(contact);
        self.candidates.insert(entry);
        true
    }

    fn add_closest(&mut self, entry: ContactAndDistance) {
        if self.failed.contains(&entry.0.id) {
            return;
        }

        self.closest.insert(entry);
    }

    /// Queues the `alpha` locally known contacts closest to the target that
    /// this lookup hasn't seen yet. Returns how many were queued.
    fn seed_from_table(&mut self) -> usize {
        let table = self.node.routes();
        let fresh: Vec<Contact> = table
            .closest(&self.target, table.len())
            .into_iter()
            .map(|ContactAndDistance(contact, _)| contact)
            .filter(|c| !self.seen.contains(&c.id))
            .take(self.alpha())
            .collect();

        fresh
            .into_iter()
            .filter(|c| self.add_candidate(*c))
            .count()
    }

    fn best_distance(&self) -> Distance {
        self.closest
            .first()
            .map(|ContactAndDistance(_, d)| *d)
            .unwrap_or(Distance::MAX)
    }

    fn best(&self) -> impl Iterator<Item = &ContactAndDistance> {
        self.closest.iter().take(self.k())
    }

    fn all_closest_queried(&self) -> bool {
        self.closest.len() >= self.k()
            && self
                .best()
                .all(|ContactAndDistance(c, _)| self.queried.contains(&c.id))
    }

    /// Members of the k best that are still waiting to be asked.
    fn unqueried_best(&self) -> Vec<ContactAndDistance> {
        self.best()
            .filter(|entry| self.candidates.contains(entry))
            .cloned()
            .collect()
    }

    async fn run(mut self) -> LookupOutcome {
        let mut found = None;

        loop {
            match self.state {
                LookupState::Init => {
                    self.seed_from_table();
                    trace!(
                        "lookup {}: seeded with {} contacts",
                        self.target,
                        self.candidates.len()
                    );
                    self.state = if self.candidates.is_empty() {
                        LookupState::Converged
                    } else {
                        LookupState::Probing
                    };
                }
                LookupState::Probing => {
                    let before = self.best_distance();
                    match self.round().await {
                        Round::Value(value) => {
                            found = Some(value);
                            self.state = LookupState::ValueFound;
                        }
                        Round::Nodes { answered } => {
                            if self.converged(before, answered) {
                                self.state = LookupState::Converged;
                            }
                        }
                    }
                }
                LookupState::Converged | LookupState::ValueFound => {
                    debug!(
                        "lookup {} ({:?}) {:?} after {} rounds: {} queried, {} failed",
                        self.target,
                        self.kind,
                        self.state,
                        self.rounds,
                        self.queried.len(),
                        self.failed.len()
                    );
                    self.state = LookupState::Done;
                }
                LookupState::Done => break,
            }
        }

        match (found, self.kind) {
            (Some(value), _) => LookupOutcome::Value(value),
            (None, LookupKind::Value) => LookupOutcome::NotFound,
            (None, LookupKind::Node) => LookupOutcome::Nodes(
                self.closest
                    .iter()
                    .filter(|ContactAndDistance(c, _)| self.queried.contains(&c.id))
                    .take(self.k())
                    .map(|ContactAndDistance(contact, _)| *contact)
                    .collect(),
            ),
        }
    }

    /// Termination check run after every round.
    fn converged(&mut self, before: Distance, answered: usize) -> bool {
        if !self.finishing {
            if answered == 0 {
                // nothing to compare against; move on to contacts not tried yet
                if !self.candidates.is_empty() || self.seed_from_table() > 0 {
                    return false;
                }
            } else if self.best_distance() < before
                && !self.all_closest_queried()
                && !self.candidates.is_empty()
            {
                return false;
            }

            self.finishing = true;
        }

        self.unqueried_best().is_empty()
    }

    /// Queries up to alpha of the closest unqueried candidates concurrently
    /// and merges their answers. The round ends when every call has returned
    /// or `round_timeout` has passed, whichever comes first.
    async fn round(&mut self) -> Round {
        self.rounds += 1;

        let mut in_flight = HashMap::new();
        let mut calls = JoinSet::new();
        let picked: Vec<ContactAndDistance> = if self.finishing {
            self.unqueried_best()
        } else {
            self.candidates.iter().take(self.alpha()).cloned().collect()
        };

        for entry in picked.into_iter().take(self.alpha()) {
            self.candidates.remove(&entry);

            let contact = entry.0;
            let node = self.node.clone();
            let target = self.target;
            let kind = self.kind;
            calls.spawn(async move { (contact.id, ask(&node, &contact, &target, kind).await) });
            in_flight.insert(contact.id, entry);
        }

        trace!(
            "lookup {}: round {} asking {} contacts",
            self.target,
            self.rounds,
            in_flight.len()
        );

        let deadline = Instant::now() + self.node.config().round_timeout;
        let mut answered = 0;

        loop {
            let joined = match tokio::time::timeout_at(deadline, calls.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        "lookup {}: round {} timed out with {} calls outstanding",
                        self.target,
                        self.rounds,
                        calls.len()
                    );
                    calls.abort_all();
                    break;
                }
            };

            let (id, result) = match joined {
                Ok(joined) => joined,
                Err(e) => {
                    warn!("lookup {}: call task failed: {}", self.target, e);
                    continue;
                }
            };
            let Some(entry) = in_flight.remove(&id) else {
                continue;
            };

            match result {
                Ok(FoundValue::Value(value)) => {
                    trace!("lookup {}: value found at {}", self.target, entry.0);
                    return Round::Value(value);
                }
                Ok(FoundValue::Nodes(nodes)) => {
                    answered += 1;
                    self.queried.insert(id);
                    self.add_closest(entry);
                    for contact in nodes {
                        let entry = self.entry(contact);
                        if self.add_candidate(contact) {
                            self.add_closest(entry);
                        }
                    }
                }
                Err(e) => {
                    trace!("lookup {}: {} failed: {}", self.target, entry.0, e);
                    self.failed.insert(id);
                    self.closest.remove(&entry);
                }
            }
        }

        // whatever didn't answer in time is out of this lookup
        for (id, entry) in in_flight {
            self.failed.insert(id);
            self.closest.remove(&entry);
        }

        Round::Nodes { answered }
    }
}

async fn ask(
    node: &Kademlia,
    dst: &Contact,
    target: &DHTKey,
    kind: LookupKind,
) -> Result<FoundValue> {
    match kind {
        LookupKind::Node => node.find_node(dst, target).await.map(FoundValue::Nodes),
        LookupKind::Value => node.find_value(dst, target).await,
    }
}

impl Kademlia {
    pub async fn lookup(&self, target: &DHTKey, kind: LookupKind) -> LookupOutcome {
        Lookup::new(self.clone(), *target, kind).run().await
    }

    /// Like [Kademlia::lookup_nodes], but also starts from `seeds`, which
    /// may not have made it into the routing table yet.
    pub async fn lookup_nodes_from(&self, target: &DHTKey, seeds: &[Contact]) -> Vec<Contact> {
        let mut lookup = Lookup::new(self.clone(), *target, LookupKind::Node);
        for seed in seeds {
            lookup.add_candidate(*seed);
        }

        match lookup.run().await {
            LookupOutcome::Nodes(nodes) => nodes,
            _ => Vec::new(),
        }
    }

    /// Finds at most k contacts closest to `target`, nearest first. The local
    /// node is never part of the result.
    pub async fn lookup_nodes(&self, target: &DHTKey) -> Vec<Contact> {
        match self.lookup(target, LookupKind::Node).await {
            LookupOutcome::Nodes(nodes) => nodes,
            _ => Vec::new(),
        }
    }

    /// Searches the network for the value stored under `key`.
    pub async fn lookup_value(&self, key: &DHTKey) -> Option<Vec<u8>> {
        match self.lookup(key, LookupKind::Value).await {
            LookupOutcome::Value(value) => Some(value),
            _ => None,
        }
    }
}
