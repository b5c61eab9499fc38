//! The in-memory key/value engine: a bounded LRU cache with per-key TTLs and
//! a background thread that proactively evicts expired keys instead of
//! waiting for a client to stumble onto them.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;

use logger::Logger;

pub const MAX_SIZE: usize = 1000;

const SAMPLE_SIZE: usize = 20;
const EXPIRED_RATIO_THRESHOLD: f64 = 0.25;
const INNER_BUDGET: Duration = Duration::from_millis(25);
const OUTER_SLEEP: Duration = Duration::from_millis(100);
const IDLE_SLEEP: Duration = Duration::from_secs(1);

struct Entry {
    key: String,
    value: Vec<u8>,
    expires_at: Option<Instant>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Entry {
    fn weight(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

struct Inner {
    map: HashMap<String, usize>,
    slab: Vec<Option<Entry>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    ttl_keys: std::collections::HashSet<String>,
    bytes: usize,
}

impl Inner {
    fn new() -> Self {
        Inner {
            map: HashMap::new(),
            slab: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            ttl_keys: std::collections::HashSet::new(),
            bytes: 0,
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let e = self.slab[index].as_ref().unwrap();
            (e.prev, e.next)
        };
        match prev {
            Some(p) => self.slab[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slab[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, index: usize) {
        let old_head = self.head;
        {
            let e = self.slab[index].as_mut().unwrap();
            e.prev = None;
            e.next = old_head;
        }
        if let Some(h) = old_head {
            self.slab[h].as_mut().unwrap().prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn touch(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        self.unlink(index);
        self.push_front(index);
    }

    fn remove_index(&mut self, index: usize) -> Entry {
        self.unlink(index);
        let entry = self.slab[index].take().expect("removed index was occupied");
        self.map.remove(&entry.key);
        self.ttl_keys.remove(&entry.key);
        self.bytes -= entry.weight();
        self.free.push(index);
        entry
    }

    fn insert_new(&mut self, key: String, value: Vec<u8>, expires_at: Option<Instant>) -> usize {
        let entry = Entry {
            key: key.clone(),
            value,
            expires_at,
            prev: None,
            next: None,
        };
        self.bytes += entry.weight();
        let index = match self.free.pop() {
            Some(i) => {
                self.slab[i] = Some(entry);
                i
            }
            None => {
                self.slab.push(Some(entry));
                self.slab.len() - 1
            }
        };
        self.map.insert(key.clone(), index);
        if expires_at.is_some() {
            self.ttl_keys.insert(key);
        }
        self.push_front(index);
        index
    }

    fn is_expired(entry: &Entry, now: Instant) -> bool {
        matches!(entry.expires_at, Some(at) if at <= now)
    }

    fn evict_lru(&mut self, logger: &Logger) -> Option<String> {
        let victim = self.tail?;
        let entry = self.remove_index(victim);
        logger.debug("evicted key to stay within capacity", "store", &entry.key);
        Some(entry.key)
    }
}

/// Outcome of one active-expiration pass, used only for logging/tests.
pub struct ExpireCycleStats {
    pub sampled: usize,
    pub expired: usize,
}

pub struct Store {
    inner: Mutex<Inner>,
    max_size: usize,
    running: AtomicBool,
}

impl Store {
    pub fn new(max_size: usize) -> Self {
        Store {
            inner: Mutex::new(Inner::new()),
            max_size,
            running: AtomicBool::new(true),
        }
    }

    /// Sets `key` to `value` with no expiration, evicting the least recently
    /// used key first if the store is at capacity.
    pub fn set(&self, key: &str, value: Vec<u8>, logger: &Logger) {
        self.set_with_expiry(key, value, None, logger);
    }

    pub fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration, logger: &Logger) {
        self.set_with_expiry(key, value, Some(Instant::now() + ttl), logger);
    }

    fn set_with_expiry(
        &self,
        key: &str,
        value: Vec<u8>,
        expires_at: Option<Instant>,
        logger: &Logger,
    ) {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(&index) = inner.map.get(key) {
            inner.remove_index(index);
        } else if inner.map.len() >= self.max_size {
            inner.evict_lru(logger);
        }
        inner.insert_new(key.to_string(), value, expires_at);
    }

    /// Returns the value for `key`, treating a lazily-discovered expired key
    /// as absent and evicting it on the spot.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let index = *inner.map.get(key)?;
        let now = Instant::now();
        let expired = Inner::is_expired(inner.slab[index].as_ref().unwrap(), now);
        if expired {
            inner.remove_index(index);
            return None;
        }
        inner.touch(index);
        Some(inner.slab[index].as_ref().unwrap().value.clone())
    }

    /// Deletes `key`. Returns `true` if it was present (and not already
    /// lazily expired).
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let Some(&index) = inner.map.get(key) else {
            return false;
        };
        let now = Instant::now();
        let expired = Inner::is_expired(inner.slab[index].as_ref().unwrap(), now);
        inner.remove_index(index);
        !expired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").bytes
    }

    /// Keys currently held, sorted lexicographically, for the paginated
    /// `/api/v1/keys` listing. Does not filter lazily-expired keys; callers
    /// that need exactness should `get` each key.
    pub fn keys_sorted(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut keys: Vec<String> = inner.map.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// A point-in-time copy of every entry, for the WebSocket `sync`
    /// message and the `get_all` action. Does not filter lazily-expired
    /// keys, matching `keys_sorted`.
    pub fn snapshot(&self) -> std::collections::BTreeMap<String, Vec<u8>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .map
            .iter()
            .map(|(k, &idx)| (k.clone(), inner.slab[idx].as_ref().unwrap().value.clone()))
            .collect()
    }

    /// Runs one active-expiration pass: samples up to `min(20, len)` keys
    /// that carry a TTL and removes the expired ones.
    pub fn active_expire_once(&self, logger: &Logger) -> ExpireCycleStats {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let sample_size = SAMPLE_SIZE.min(inner.ttl_keys.len());
        if sample_size == 0 {
            return ExpireCycleStats { sampled: 0, expired: 0 };
        }
        let sampled: Vec<String> = inner
            .ttl_keys
            .iter()
            .cloned()
            .choose_multiple(&mut rand::rng(), sample_size);
        let now = Instant::now();
        let mut expired = 0;
        for key in &sampled {
            if let Some(&index) = inner.map.get(key) {
                if Inner::is_expired(inner.slab[index].as_ref().unwrap(), now) {
                    inner.remove_index(index);
                    expired += 1;
                }
            }
        }
        if expired > 0 {
            logger.debug(
                "active expire cycle removed keys",
                "store",
                format!("{expired}/{}", sampled.len()),
            );
        }
        ExpireCycleStats { sampled: sampled.len(), expired }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Spawns the background thread that drives active expiration: keeps
/// sampling while more than a quarter of the last sample was expired and an
/// inner time budget remains, then sleeps before the next pass. Sleeps
/// longer when nothing in the store currently carries a TTL.
pub fn spawn_expiration_thread(store: Arc<Store>, logger: Arc<Logger>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while store.is_running() {
            let budget_start = Instant::now();
            let mut any_sampled = false;
            loop {
                let stats = store.active_expire_once(&logger);
                if stats.sampled > 0 {
                    any_sampled = true;
                }
                let ratio = if stats.sampled == 0 {
                    0.0
                } else {
                    stats.expired as f64 / stats.sampled as f64
                };
                if ratio <= EXPIRED_RATIO_THRESHOLD || budget_start.elapsed() >= INNER_BUDGET {
                    break;
                }
            }
            if any_sampled {
                std::thread::sleep(OUTER_SLEEP);
            } else {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> Logger {
        Logger::null()
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = Store::new(10);
        store.set("a", b"1".to_vec(), &logger());
        assert_eq!(store.get("a"), Some(b"1".to_vec()));
    }

    #[test]
    fn get_on_missing_key_is_none() {
        let store = Store::new(10);
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn capacity_eviction_drops_the_least_recently_used_key() {
        let store = Store::new(2);
        let log = logger();
        store.set("a", b"1".to_vec(), &log);
        store.set("b", b"2".to_vec(), &log);
        store.set("c", b"3".to_vec(), &log);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a"), None);
        assert!(store.get("b").is_some());
        assert!(store.get("c").is_some());
    }

    #[test]
    fn get_refreshes_recency_and_saves_from_eviction() {
        let store = Store::new(2);
        let log = logger();
        store.set("a", b"1".to_vec(), &log);
        store.set("b", b"2".to_vec(), &log);
        let _ = store.get("a");
        store.set("c", b"3".to_vec(), &log);
        assert!(store.get("a").is_some());
        assert_eq!(store.get("b"), None);
    }

    #[test]
    fn delete_returns_whether_key_was_present() {
        let store = Store::new(10);
        store.set("a", b"1".to_vec(), &logger());
        assert!(store.delete("a"));
        assert!(!store.delete("a"));
    }

    #[test]
    fn ttl_key_is_lazily_expired_on_get() {
        let store = Store::new(10);
        store.set_with_ttl("a", b"1".to_vec(), Duration::from_millis(1), &logger());
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(store.get("a"), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn active_expire_cycle_removes_expired_sampled_keys() {
        let store = Store::new(10);
        store.set_with_ttl("a", b"1".to_vec(), Duration::from_millis(1), &logger());
        std::thread::sleep(Duration::from_millis(10));
        let stats = store.active_expire_once(&logger());
        assert_eq!(stats.sampled, 1);
        assert_eq!(stats.expired, 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn active_expire_cycle_is_a_no_op_without_ttl_keys() {
        let store = Store::new(10);
        store.set("a", b"1".to_vec(), &logger());
        let stats = store.active_expire_once(&logger());
        assert_eq!(stats.sampled, 0);
    }

    #[test]
    fn total_bytes_tracks_key_and_value_length() {
        let store = Store::new(10);
        store.set("ab", b"cd".to_vec(), &logger());
        assert_eq!(store.total_bytes(), 4);
        store.delete("ab");
        assert_eq!(store.total_bytes(), 0);
    }

    #[test]
    fn snapshot_copies_every_current_entry() {
        let store = Store::new(10);
        let log = logger();
        store.set("a", b"1".to_vec(), &log);
        store.set("b", b"2".to_vec(), &log);
        let snap = store.snapshot();
        assert_eq!(snap.get("a"), Some(&b"1".to_vec()));
        assert_eq!(snap.get("b"), Some(&b"2".to_vec()));
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn keys_sorted_is_lexicographic() {
        let store = Store::new(10);
        let log = logger();
        store.set("b", b"1".to_vec(), &log);
        store.set("a", b"1".to_vec(), &log);
        assert_eq!(store.keys_sorted(), vec!["a".to_string(), "b".to_string()]);
    }
}
