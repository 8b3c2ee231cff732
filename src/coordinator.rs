use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot, watch,
};
use tracing::{debug, trace, warn};

use crate::{
    client::Outbound,
    routing::{Contact, RoutingTable, Touch},
};

#[derive(Debug)]
enum Event {
    /// A contact answered a request or sent us one.
    Observed(Contact),
    /// Outcome of pinging `oldest` on behalf of `candidate`.
    Pinged {
        index: usize,
        oldest: Contact,
        candidate: Contact,
        alive: bool,
    },
    /// Apply everything queued so far, then stop.
    Shutdown(oneshot::Sender<()>),
}

/// Cheap handle to the routing table owner. Writes go through the event
/// queue; reads are served from the latest published snapshot.
#[derive(Clone)]
pub struct Coordinator {
    events: mpsc::Sender<Event>,
    snapshot: watch::Receiver<Arc<RoutingTable>>,
}

impl Coordinator {
    /// Spawns the routing table owner and returns a handle to it.
    pub fn spawn(table: RoutingTable, outbound: Outbound, queue_len: usize) -> Coordinator {
        let (events, rx) = mpsc::channel(queue_len);
        let (snapshot_tx, snapshot) = watch::channel(Arc::new(table.clone()));

        let worker = Worker {
            table,
            rx,
            pings: events.downgrade(),
            snapshot: snapshot_tx,
            outbound,
            pinging: HashSet::new(),
            waiting: HashMap::new(),
            closing: false,
        };
        tokio::spawn(worker.run());

        Coordinator { events, snapshot }
    }

    /// Reports a sighting without waiting. If the queue is full the sighting
    /// is dropped; the contact will be seen again.
    pub fn observe(&self, contact: Contact) {
        match self.events.try_send(Event::Observed(contact)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("{}: routing event queue full, dropping sighting", contact)
            }
            Err(TrySendError::Closed(_)) => {
                trace!("{}: coordinator stopped, dropping sighting", contact)
            }
        }
    }

    /// Current view of the routing table. It may lag behind queued events.
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.snapshot.borrow().clone()
    }

    /// Receiver that is notified each time a new snapshot is published.
    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<Arc<RoutingTable>> {
        self.snapshot.clone()
    }

    /// Drains pending events and stops the coordinator. Returns once the
    /// final snapshot has been published.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.events.send(Event::Shutdown(tx)).await.is_err() {
            return;
        }
        _ = rx.await;
    }
}

struct Worker {
    table: RoutingTable,
    rx: mpsc::Receiver<Event>,
    pings: mpsc::WeakSender<Event>,
    snapshot: watch::Sender<Arc<RoutingTable>>,
    outbound: Outbound,
    /// Buckets whose head is being pinged.
    pinging: HashSet<usize>,
    /// Newcomers for those buckets, offered again once the ping is over.
    waiting: HashMap<usize, VecDeque<Contact>>,
    /// Set while draining; no pings are started then.
    closing: bool,
}

impl Worker {
    async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            match event {
                Event::Observed(contact) => self.observe(contact),
                Event::Pinged {
                    index,
                    oldest,
                    candidate,
                    alive,
                } => self.apply_ping(index, oldest, candidate, alive),
                Event::Shutdown(ack) => {
                    self.drain();
                    _ = ack.send(());
                    break;
                }
            }
        }

        debug!("routing table coordinator stopped");
    }

    /// Applies whatever is still queued. No new pings are started, so full
    /// buckets simply keep their contacts.
    fn drain(&mut self) {
        self.closing = true;
        self.rx.close();
        while let Ok(event) = self.rx.try_recv() {
            match event {
                Event::Observed(contact) => self.observe(contact),
                Event::Pinged {
                    index,
                    oldest,
                    candidate,
                    alive,
                } => self.apply_ping(index, oldest, candidate, alive),
                Event::Shutdown(ack) => {
                    _ = ack.send(());
                }
            }
        }
    }

    fn observe(&mut self, contact: Contact) {
        match self.table.touch(contact) {
            Touch::Local => {}
            Touch::Refreshed | Touch::Inserted => self.publish(),
            Touch::Full { .. } if self.closing => {
                trace!("{}: bucket is full while closing, dropping", contact)
            }
            Touch::Full { index, oldest } => {
                if self.pinging.insert(index) {
                    self.ping_head(index, oldest, contact);
                } else {
                    self.wait(index, contact);
                }
            }
        }
    }

    /// Parks a newcomer until the bucket's head has been pinged. At most k are kept,
    /// and a contact is parked only once.
    fn wait(&mut self, index: usize, contact: Contact) {
        let k = self.table.k();
        let queue = self.waiting.entry(index).or_default();
        if queue.iter().any(|c| c.id == contact.id) {
            return;
        }
        if queue.len() >= k {
            trace!("{}: bucket {} backlog full, dropping", contact, index);
            return;
        }
        queue.push_back(contact);
    }

    /// Offers parked newcomers again until one of them starts a new ping.
    fn resume(&mut self, index: usize) {
        while !self.closing && !self.pinging.contains(&index) {
            let Some(next) = self.waiting.get_mut(&index).and_then(|q| q.pop_front()) else {
                break;
            };
            self.observe(next);
        }

        if self.waiting.get(&index).is_some_and(|q| q.is_empty()) {
            self.waiting.remove(&index);
        }
    }

    /// Pings the least recently seen contact of a full bucket. The answer is
    /// fed back through the queue so the bucket is only ever written here.
    fn ping_head(&self, index: usize, oldest: Contact, candidate: Contact) {
        let outbound = self.outbound.clone();
        let pings = self.pings.clone();

        tokio::spawn(async move {
            let alive = match outbound.ping(oldest.addr).await {
                Ok(pong) => pong.sender.id == oldest.id,
                Err(e) => {
                    debug!("{}: liveness ping failed: {}", oldest, e);
                    false
                }
            };

            let Some(events) = pings.upgrade() else {
                return;
            };
            let pinged = Event::Pinged {
                index,
                oldest,
                candidate,
                alive,
            };
            if events.send(pinged).await.is_err() {
                trace!("{}: coordinator stopped before ping result", oldest);
            }
        });
    }

    fn apply_ping(&mut self, index: usize, oldest: Contact, candidate: Contact, alive: bool) {
        self.pinging.remove(&index);

        if alive {
            // long-lived contacts win; the candidate is dropped
            self.table.refresh(&oldest.id);
            debug!("{}: still alive, dropping {}", oldest, candidate);
        } else if self.table.replace(&oldest.id, candidate) {
            debug!("{}: evicted in favour of {}", oldest, candidate);
        } else {
            warn!("{}: evicted but {} could not be inserted", oldest, candidate);
        }

        self.publish();
        self.resume(index);
    }

    fn publish(&self) {
        self.snapshot.send_replace(Arc::new(self.table.clone()));
    }
}
