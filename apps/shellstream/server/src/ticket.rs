use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use rand::RngCore;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

const TOKEN_BYTES: usize = 16;

#[derive(Debug, Clone)]
pub struct TicketConfig {
    pub ttl: Duration,
    pub capacity: usize,
    pub sweep_interval: Duration,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            capacity: 1000,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TicketError {
    #[error("ticket not found")]
    NotFound,
    #[error("too many in-flight requests")]
    CapacityExceeded,
}

impl TicketError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            TicketError::NotFound => "not_found",
            TicketError::CapacityExceeded => "too_many_in_flight",
        }
    }
}

/// A freshly issued token and the instant after which it stops working.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub token: String,
    pub expires_at: Instant,
}

/// Single-use, time-bounded tokens mapping to pending requests.
///
/// Every token is handed out by [`TicketCache::insert`] and can be redeemed
/// once through [`TicketCache::consume`] before its TTL runs out. Unknown,
/// expired and already-redeemed tokens are indistinguishable to callers.
///
/// Values the cache drops without handing them out (evicted, expired or
/// rejected) go to the discard hook, if one is set.
pub struct TicketCache<T> {
    inner: Arc<TicketCacheInner<T>>,
}

impl<T> Clone for TicketCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

type DiscardHook<T> = Box<dyn Fn(T) + Send + Sync>;

struct TicketCacheInner<T> {
    config: TicketConfig,
    entries: Mutex<Entries<T>>,
    on_discard: Option<DiscardHook<T>>,
}

struct Entries<T> {
    by_token: HashMap<String, Pending<T>>,
    by_expiry: BTreeMap<(Instant, u64), String>,
    next_seq: u64,
}

struct Pending<T> {
    expiry_key: (Instant, u64),
    value: T,
}

impl<T> Entries<T> {
    fn remove(&mut self, token: &str) -> Option<Pending<T>> {
        let pending = self.by_token.remove(token)?;
        self.by_expiry.remove(&pending.expiry_key);
        Some(pending)
    }

    fn evict_earliest(&mut self) -> Option<T> {
        let (_, token) = self.by_expiry.pop_first()?;
        self.by_token.remove(&token).map(|pending| pending.value)
    }

    fn purge_expired(&mut self, now: Instant, discarded: &mut Vec<T>) -> usize {
        let mut purged = 0;
        while let Some(entry) = self.by_expiry.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let token = entry.remove();
            if let Some(pending) = self.by_token.remove(&token) {
                discarded.push(pending.value);
            }
            purged += 1;
        }
        purged
    }
}

impl<T: Send + 'static> TicketCache<T> {
    pub fn new(config: TicketConfig) -> Self {
        Self::build(config, None)
    }

    /// Like [`TicketCache::new`], passing every dropped value to `hook`.
    pub fn with_discard_hook(config: TicketConfig, hook: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::build(config, Some(Box::new(hook)))
    }

    fn build(config: TicketConfig, on_discard: Option<DiscardHook<T>>) -> Self {
        Self {
            inner: Arc::new(TicketCacheInner {
                config,
                entries: Mutex::new(Entries {
                    by_token: HashMap::new(),
                    by_expiry: BTreeMap::new(),
                    next_seq: 0,
                }),
                on_discard,
            }),
        }
    }

    fn discard(&self, values: Vec<T>) {
        if let Some(hook) = &self.inner.on_discard {
            for value in values {
                hook(value);
            }
        }
    }

    pub fn config(&self) -> &TicketConfig {
        &self.inner.config
    }

    /// Stores `value` under a new random token.
    ///
    /// A full cache first evicts the ticket closest to expiry; insertion only
    /// fails at capacity zero.
    pub fn insert(&self, value: T) -> Result<Ticket, TicketError> {
        let capacity = self.inner.config.capacity;
        if capacity == 0 {
            counter!("shellstream_tickets_rejected_total", 1, "reason" => "too_many_in_flight");
            self.discard(vec![value]);
            return Err(TicketError::CapacityExceeded);
        }

        let now = Instant::now();
        let expires_at = now + self.inner.config.ttl;
        let mut discarded = Vec::new();
        let mut entries = self.inner.entries.lock();
        entries.purge_expired(now, &mut discarded);
        while entries.by_token.len() >= capacity {
            match entries.evict_earliest() {
                Some(evicted) => discarded.push(evicted),
                None => break,
            }
            counter!("shellstream_tickets_evicted_total", 1);
        }

        let token = loop {
            let token = generate_token();
            if !entries.by_token.contains_key(&token) {
                break token;
            }
        };
        let expiry_key = (expires_at, entries.next_seq);
        entries.next_seq += 1;
        entries.by_expiry.insert(expiry_key, token.clone());
        entries
            .by_token
            .insert(token.clone(), Pending { expiry_key, value });
        gauge!("shellstream_tickets_pending", entries.by_token.len() as f64);
        drop(entries);
        self.discard(discarded);

        counter!("shellstream_tickets_issued_total", 1);
        Ok(Ticket { token, expires_at })
    }

    /// Redeems `token`, removing it whether or not it had already expired.
    pub fn consume(&self, token: &str) -> Result<T, TicketError> {
        let now = Instant::now();
        let pending = self.inner.entries.lock().remove(token);
        match pending {
            Some(pending) if pending.expiry_key.0 > now => Ok(pending.value),
            expired => {
                counter!("shellstream_tickets_rejected_total", 1, "reason" => "not_found");
                self.discard(expired.into_iter().map(|pending| pending.value).collect());
                Err(TicketError::NotFound)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired ticket; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut discarded = Vec::new();
        let mut entries = self.inner.entries.lock();
        let purged = entries.purge_expired(Instant::now(), &mut discarded);
        gauge!("shellstream_tickets_pending", entries.by_token.len() as f64);
        drop(entries);
        self.discard(discarded);
        purged
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let cache = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.sweep_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let purged = cache.sweep();
                if purged > 0 {
                    debug!(purged, "swept expired tickets");
                }
            }
        })
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> TicketCache<&'static str> {
        TicketCache::new(TicketConfig {
            ttl: Duration::from_secs(60),
            capacity,
            sweep_interval: Duration::from_secs(30),
        })
    }

    #[test_timeout::tokio_timeout_test]
    async fn tokens_redeem_exactly_once() {
        let cache = cache(4);
        let ticket = cache.insert("ls").expect("insert");
        assert_eq!(ticket.token.len(), 22);
        assert_eq!(cache.consume(&ticket.token), Ok("ls"));
        assert_eq!(cache.consume(&ticket.token), Err(TicketError::NotFound));
        assert_eq!(cache.consume("never-issued"), Err(TicketError::NotFound));
    }

    #[test_timeout::tokio_timeout_test]
    async fn expired_tokens_look_unknown() {
        tokio::time::pause();
        let cache = cache(4);
        let ticket = cache.insert("ls").expect("insert");
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.consume(&ticket.token), Err(TicketError::NotFound));
        assert!(cache.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn full_cache_evicts_earliest_expiry() {
        tokio::time::pause();
        let cache = cache(2);
        let first = cache.insert("first").expect("insert");
        tokio::time::advance(Duration::from_secs(1)).await;
        let second = cache.insert("second").expect("insert");
        tokio::time::advance(Duration::from_secs(1)).await;
        let third = cache.insert("third").expect("insert past capacity");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.consume(&first.token), Err(TicketError::NotFound));
        assert_eq!(cache.consume(&second.token), Ok("second"));
        assert_eq!(cache.consume(&third.token), Ok("third"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn zero_capacity_rejects_insert() {
        let cache = cache(0);
        assert_eq!(cache.insert("ls"), Err(TicketError::CapacityExceeded));
    }

    #[test_timeout::timeout]
    fn concurrent_consumers_race_for_one_token() {
        let cache = cache(4);
        let ticket = cache.insert("ls").expect("insert");
        let start = Arc::new(std::sync::Barrier::new(16));
        let racers: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let token = ticket.token.clone();
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    cache.consume(&token)
                })
            })
            .collect();

        let redeemed = racers
            .into_iter()
            .map(|racer| racer.join().expect("racer"))
            .filter(Result::is_ok)
            .count();
        assert_eq!(redeemed, 1);
        assert!(cache.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropped_values_reach_the_discard_hook() {
        tokio::time::pause();
        let discarded = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&discarded);
        let cache = TicketCache::with_discard_hook(
            TicketConfig {
                ttl: Duration::from_secs(60),
                capacity: 1,
                sweep_interval: Duration::from_secs(30),
            },
            move |value: &'static str| seen.lock().push(value),
        );

        cache.insert("evicted").expect("insert");
        let kept = cache.insert("kept").expect("insert");
        assert_eq!(*discarded.lock(), vec!["evicted"]);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.consume(&kept.token), Err(TicketError::NotFound));
        assert_eq!(*discarded.lock(), vec!["evicted", "kept"]);

        cache.insert("swept").expect("insert");
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.sweep(), 1);
        assert_eq!(*discarded.lock(), vec!["evicted", "kept", "swept"]);

        let rejecting = TicketCache::with_discard_hook(
            TicketConfig {
                capacity: 0,
                ..TicketConfig::default()
            },
            {
                let seen = Arc::clone(&discarded);
                move |value: &'static str| seen.lock().push(value)
            },
        );
        assert_eq!(rejecting.insert("rejected"), Err(TicketError::CapacityExceeded));
        assert_eq!(discarded.lock().last(), Some(&"rejected"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn sweeper_runs_for_values_that_are_not_clone() {
        #[derive(Debug)]
        struct Exclusive;

        tokio::time::pause();
        let cache = TicketCache::new(TicketConfig {
            ttl: Duration::from_secs(5),
            capacity: 4,
            sweep_interval: Duration::from_secs(1),
        });
        cache.insert(Exclusive).expect("insert");
        let sweeper = cache.spawn_sweeper();

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(cache.is_empty());
        sweeper.abort();
    }

    #[test_timeout::tokio_timeout_test]
    async fn sweep_drops_only_expired() {
        tokio::time::pause();
        let cache = cache(8);
        cache.insert("old").expect("insert");
        tokio::time::advance(Duration::from_secs(45)).await;
        let fresh = cache.insert("fresh").expect("insert");
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.consume(&fresh.token), Ok("fresh"));
    }
}
