//! A pull-mode dmClock priority queue.
//!
//! Each client (a scheduler identity) owns a FIFO of requests tagged at
//! arrival with three virtual times:
//!
//! - a *reservation* tag, advanced by `cost / reservation` (the floor rate);
//! - a *proportion* tag, advanced by `cost / weight` (the contention share);
//! - a *limit* tag, advanced by `cost / limit` (the ceiling rate).
//!
//! A pull first serves the smallest reservation tag that has come due, then
//! the smallest proportion tag among clients whose limit tag has come due.
//! If neither phase has an eligible head, the pull reports the earliest
//! instant at which one will.
//!
//! All tags are clamped forward to "now" so that an idle client does not
//! accumulate credit.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Rates are in cost units per second. `limit == f64::INFINITY` means
/// "no ceiling"; `reservation == 0.0` means "no floor".
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ClientInfo {
    pub reservation: f64,
    pub weight: f64,
    pub limit: f64,
}

impl ClientInfo {
    pub fn new(reservation: f64, weight: f64, limit: f64) -> Self {
        ClientInfo {
            reservation,
            weight,
            limit,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Tags {
    reservation: f64,
    proportion: f64,
    limit: f64,
}

struct ClientQueue<I> {
    requests: VecDeque<(Tags, I)>,
    /// Tags of the most recently accepted request; the base for the next
    /// request's tags. Survives the queue draining so that a busy client
    /// cannot reset its own clock by going momentarily idle.
    last: Option<Tags>,
}

impl<I> ClientQueue<I> {
    fn new() -> Self {
        ClientQueue {
            requests: VecDeque::new(),
            last: None,
        }
    }
}

pub(crate) enum Pull<I> {
    /// An item is eligible right now.
    Ready(I),
    /// Nothing is eligible before the returned time (in queue seconds).
    Future(f64),
    /// No requests at all.
    Empty,
}

pub(crate) struct MclockQueue<K, I> {
    clients: HashMap<K, ClientQueue<I>>,
    len: usize,
}

impl<K: Eq + Hash + Copy, I> MclockQueue<K, I> {
    pub fn new() -> Self {
        MclockQueue {
            clients: HashMap::new(),
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Per-client backlog sizes, for dump output.
    pub fn depths(&self) -> Vec<(K, usize)> {
        self.clients
            .iter()
            .filter(|(_, c)| !c.requests.is_empty())
            .map(|(k, c)| (*k, c.requests.len()))
            .collect()
    }

    pub fn add_request(&mut self, key: K, info: &ClientInfo, cost: u32, item: I, now: f64) {
        let client = self.clients.entry(key).or_insert_with(ClientQueue::new);
        let cost = f64::from(cost.max(1));

        let tags = match client.last {
            None => Tags {
                reservation: if info.reservation > 0.0 {
                    now
                } else {
                    f64::INFINITY
                },
                proportion: now,
                limit: now,
            },
            Some(prev) => Tags {
                reservation: if info.reservation > 0.0 {
                    f64::max(now, prev.reservation + cost / info.reservation)
                } else {
                    f64::INFINITY
                },
                proportion: f64::max(now, prev.proportion + cost / info.weight),
                limit: if info.limit.is_finite() && info.limit > 0.0 {
                    f64::max(now, prev.limit + cost / info.limit)
                } else {
                    now
                },
            },
        };

        client.last = Some(tags);
        client.requests.push_back((tags, item));
        self.len += 1;
    }

    pub fn pull_request(&mut self, now: f64) -> Pull<I> {
        if self.len == 0 {
            return Pull::Empty;
        }

        // Reservation phase: the smallest due reservation tag wins.
        let winner = self
            .heads()
            .filter(|(_, t)| t.reservation <= now)
            .min_by(|a, b| a.1.reservation.total_cmp(&b.1.reservation))
            .map(|(k, _)| k);
        if let Some(key) = winner {
            return Pull::Ready(self.pop(key));
        }

        // Weight phase: among limit-eligible clients, the smallest
        // proportion tag wins.
        let winner = self
            .heads()
            .filter(|(_, t)| t.limit <= now)
            .min_by(|a, b| a.1.proportion.total_cmp(&b.1.proportion))
            .map(|(k, _)| k);
        if let Some(key) = winner {
            return Pull::Ready(self.pop(key));
        }

        // Nothing eligible: report when the earliest head becomes so,
        // either through its reservation or through its limit clearing.
        let earliest = self
            .heads()
            .map(|(_, t)| f64::min(t.reservation, t.limit))
            .fold(f64::INFINITY, f64::min);
        Pull::Future(earliest)
    }

    fn heads(&self) -> impl Iterator<Item = (K, Tags)> + '_ {
        self.clients
            .iter()
            .filter_map(|(k, c)| c.requests.front().map(|(t, _)| (*k, *t)))
    }

    fn pop(&mut self, key: K) -> I {
        let client = self.clients.get_mut(&key).expect("winner exists");
        let (_, item) = client.requests.pop_front().expect("head exists");
        self.len -= 1;
        item
    }
}
