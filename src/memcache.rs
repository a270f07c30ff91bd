//! MemCache (C2): one cache partition's hot state plus its durable mirror.

use crate::durable::DurableStore;
use crate::error::Result;
use crate::message::{KvMessage, PROP_CACHE_ID, PROP_TTL, PROP_TTLD};
use std::collections::{HashMap, VecDeque};

/// One cache partition: in-memory map keyed by string, a durable mirror,
/// a monotonic sequence counter, and a passive-role pending queue.
pub struct MemCache {
    cache_id: String,
    // `None` means "no snapshot received yet" (client bootstrap / fresh
    // backup); `Some(empty)` means "known-empty, ready to serve".
    map: Option<HashMap<String, KvMessage>>,
    sequence: u64,
    pending: VecDeque<KvMessage>,
    durable: Option<DurableStore>,
}

impl MemCache {
    /// Create a MemCache with an already-allocated empty map (server-side
    /// primary at startup) and an open durable store.
    pub fn new_with_durable(cache_id: impl Into<String>, durable: DurableStore) -> Self {
        Self {
            cache_id: cache_id.into(),
            map: Some(HashMap::new()),
            sequence: 0,
            pending: VecDeque::new(),
            durable: Some(durable),
        }
    }

    /// Create a MemCache with a null map (client-side bootstrap, or a
    /// passive server before its first snapshot).
    pub fn new_empty(cache_id: impl Into<String>) -> Self {
        Self {
            cache_id: cache_id.into(),
            map: None,
            sequence: 0,
            pending: VecDeque::new(),
            durable: None,
        }
    }

    /// This partition's id.
    pub fn cache_id(&self) -> &str {
        &self.cache_id
    }

    /// Current sequence watermark.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// True if a snapshot has never been applied (map is null).
    pub fn is_null(&self) -> bool {
        self.map.is_none()
    }

    /// Allocate an empty map if one is not already present.
    pub fn ensure_allocated(&mut self) {
        if self.map.is_none() {
            self.map = Some(HashMap::new());
        }
    }

    /// Wipe the in-memory map back to null and drop the durable store
    /// (spec.md §4.2 lifecycle: destroyed on transition active -> passive).
    pub fn wipe(&mut self) -> Result<()> {
        self.map = None;
        self.sequence = 0;
        self.pending.clear();
        if let Some(durable) = self.durable.take() {
            durable.destroy()?;
        }
        Ok(())
    }

    /// Bump and return the next sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Directly set the sequence watermark, e.g. while replaying a snapshot.
    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Iterate the current map contents.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &KvMessage)> {
        self.map.iter().flatten()
    }

    /// Look up a single key's stored message.
    pub fn get(&self, key: &str) -> Option<&KvMessage> {
        self.map.as_ref().and_then(|m| m.get(key))
    }

    /// §4.1 `store`: if BODY is present and non-empty, insert-or-replace
    /// under KEY; otherwise delete KEY. Mirrors the change to the durable
    /// store (or deletes it) and rewrites the reserved SEQUENCENUMBER.
    pub fn store(&mut self, msg: &KvMessage) -> Result<()> {
        let key = msg.key_str().to_string();
        if msg.is_set() {
            self.map.get_or_insert_with(HashMap::new).insert(key.clone(), msg.clone());
            if let Some(durable) = &self.durable {
                durable.put(&key, msg.body())?;
                durable.put_sequence(self.sequence)?;
            }
        } else {
            if let Some(map) = self.map.as_mut() {
                map.remove(&key);
            }
            if let Some(durable) = &self.durable {
                durable.remove(&key)?;
                durable.put_sequence(self.sequence)?;
            }
        }
        Ok(())
    }

    /// Attach an already-opened durable store without touching the map or
    /// sequence (passive-role snapshot bootstrap: the map is rebuilt frame
    /// by frame from the peer as it arrives).
    pub fn attach_durable(&mut self, durable: DurableStore) {
        self.durable = Some(durable);
    }

    /// Attach a durable store and recover from it (primary startup path).
    /// Reads `SEQUENCENUMBER`; if present, rebuilds the map from every
    /// other entry, each wrapped in a fresh KVMessage, and sets `sequence`
    /// to the recovered watermark.
    pub fn recover_from_durable(&mut self, durable: DurableStore) -> Result<()> {
        if let Some(recovered_seq) = durable.get_sequence()? {
            let mut map = HashMap::new();
            for (key, value) in durable.iterate()? {
                if key == crate::durable::SEQUENCENUMBER {
                    continue;
                }
                let mut msg = KvMessage::new(recovered_seq);
                msg.set_key(key.clone().into_bytes());
                msg.set_prop(PROP_CACHE_ID, &self.cache_id);
                msg.set_body(value);
                map.insert(key, msg);
            }
            self.map = Some(map);
            self.sequence = recovered_seq;
        } else {
            self.map = Some(HashMap::new());
        }
        self.durable = Some(durable);
        Ok(())
    }

    /// §4.2 `flushExpired`: for each entry whose `ttl` property is `<= now`,
    /// bump the sequence, mark it `ttld=1` with an empty body, store the
    /// resulting deletion, and return it for the caller to publish.
    pub fn flush_expired(&mut self, now_ms: u64) -> Result<Vec<KvMessage>> {
        let expired: Vec<String> = self
            .map
            .iter()
            .flatten()
            .filter_map(|(key, msg)| {
                let ttl = msg.get_prop(PROP_TTL);
                match ttl.parse::<u64>() {
                    Ok(ttl_ms) if ttl_ms <= now_ms => Some(key.clone()),
                    _ => None,
                }
            })
            .collect();

        let mut published = Vec::with_capacity(expired.len());
        for key in expired {
            let seq = self.next_sequence();
            let mut msg = KvMessage::new(seq);
            msg.set_key(key.into_bytes());
            msg.set_prop(PROP_CACHE_ID, &self.cache_id);
            msg.set_prop(PROP_TTLD, "1");
            // body left empty: store() below deletes the entry.
            self.store(&msg)?;
            published.push(msg);
        }
        Ok(published)
    }

    /// Append a client-originated update to the pending queue, unconditionally.
    pub fn enqueue_pending(&mut self, msg: KvMessage) {
        self.pending.push_back(msg);
    }

    /// `s_was_pending`: search the pending queue for a message with the
    /// same UUID as `uuid`. If found, remove it and return `true` (the
    /// active has already accepted this write). Otherwise return `false`.
    pub fn dedup_pending(&mut self, uuid: [u8; 16]) -> bool {
        if let Some(pos) = self.pending.iter().position(|m| m.uuid() == uuid) {
            self.pending.remove(pos);
            true
        } else {
            false
        }
    }

    /// Apply a client-originated update arriving on the collector while
    /// passive: `ttld=1` messages are dropped outright (the server never
    /// originates those from a client connection), duplicates of an
    /// already-pending write are dropped, and everything else is queued for
    /// the eventual `drain_pending` on transition to active.
    pub fn apply_pending_update(&mut self, msg: KvMessage) {
        if msg.get_prop(PROP_TTLD) == "1" {
            return;
        }
        if self.dedup_pending(msg.uuid()) {
            return;
        }
        self.enqueue_pending(msg);
    }

    /// `s_subscriber`: apply an update arriving on the peer-publisher bus.
    /// Reconciles against the pending queue (`s_was_pending`) and then, if
    /// the message carries a sequence newer than our own, advances the
    /// watermark and applies it to the map and durable mirror — this is the
    /// only path that actually writes bus-originated data (TTL deletions
    /// included, since `store` treats an empty body as a delete); the
    /// collector path only ever queues.
    pub fn apply_bus_update(&mut self, msg: KvMessage) -> Result<()> {
        self.dedup_pending(msg.uuid());
        if msg.sequence() > self.sequence {
            self.sequence = msg.sequence();
            self.store(&msg)?;
        }
        Ok(())
    }

    /// §4.5 `s_new_active`: drain the pending queue in FIFO order, each
    /// entry acquiring a fresh sequence number before being stored; return
    /// the drained messages for the caller to publish.
    pub fn drain_pending(&mut self) -> Result<Vec<KvMessage>> {
        let mut published = Vec::with_capacity(self.pending.len());
        while let Some(mut msg) = self.pending.pop_front() {
            let seq = self.next_sequence();
            msg.set_sequence(seq);
            self.store(&msg)?;
            published.push(msg);
        }
        Ok(published)
    }

    /// True if the pending queue currently holds anything.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PROP_CACHE_ID;

    fn durable_in(dir: &tempfile::TempDir) -> DurableStore {
        DurableStore::open(dir.path()).unwrap()
    }

    #[test]
    fn store_set_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut mc = MemCache::new_with_durable("c0", durable_in(&dir));

        let mut set_msg = KvMessage::new(1);
        set_msg.set_key(b"k".to_vec());
        set_msg.set_body(b"v".to_vec());
        mc.set_sequence(1);
        mc.store(&set_msg).unwrap();
        assert_eq!(mc.get("k").unwrap().body(), b"v");

        let mut del_msg = KvMessage::new(2);
        del_msg.set_key(b"k".to_vec());
        mc.set_sequence(2);
        mc.store(&del_msg).unwrap();
        assert!(mc.get("k").is_none());
    }

    #[test]
    fn sequencenumber_mirrors_memcache_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut mc = MemCache::new_with_durable("c0", durable_in(&dir));
        let mut msg = KvMessage::new(0);
        msg.set_key(b"k".to_vec());
        msg.set_body(b"v".to_vec());
        let seq = mc.next_sequence();
        msg.set_sequence(seq);
        mc.store(&msg).unwrap();

        let durable = DurableStore::open(dir.path()).unwrap();
        assert_eq!(durable.get_sequence().unwrap(), Some(mc.sequence()));
    }

    #[test]
    fn flush_expired_deletes_and_stamps_ttld() {
        let dir = tempfile::tempdir().unwrap();
        let mut mc = MemCache::new_with_durable("c0", durable_in(&dir));
        let mut msg = KvMessage::new(0);
        msg.set_key(b"eph".to_vec());
        msg.set_body(b"x".to_vec());
        msg.set_prop(PROP_TTL, "1000");
        let seq = mc.next_sequence();
        msg.set_sequence(seq);
        mc.store(&msg).unwrap();

        let published = mc.flush_expired(2000).unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].get_prop(crate::message::PROP_TTLD), "1");
        assert!(mc.get("eph").is_none());
    }

    #[test]
    fn pending_dedup_drops_duplicate_and_queues_unknown() {
        let mut mc = MemCache::new_empty("c0");
        let mut msg = KvMessage::new(0);
        msg.set_key(b"k".to_vec());
        msg.set_prop(PROP_CACHE_ID, "c0");

        // First arrival: no match in pending, gets queued.
        mc.apply_pending_update(msg.clone());
        assert!(mc.has_pending());

        // Second arrival with same UUID: dedup removes it instead of
        // queueing a second copy.
        mc.apply_pending_update(msg);
        assert!(!mc.has_pending());
    }

    #[test]
    fn bus_update_applies_newer_entries_and_deletions() {
        let dir = tempfile::tempdir().unwrap();
        let mut mc = MemCache::new_with_durable("c0", durable_in(&dir));

        let mut set_msg = KvMessage::new(1);
        set_msg.set_key(b"eph".to_vec());
        set_msg.set_body(b"x".to_vec());
        mc.apply_bus_update(set_msg).unwrap();
        assert_eq!(mc.get("eph").unwrap().body(), b"x");
        assert_eq!(mc.sequence(), 1);

        let mut ttld_msg = KvMessage::new(2);
        ttld_msg.set_key(b"eph".to_vec());
        ttld_msg.set_prop(PROP_TTLD, "1");
        mc.apply_bus_update(ttld_msg).unwrap();
        assert!(mc.get("eph").is_none());
        assert_eq!(mc.sequence(), 2);
    }

    #[test]
    fn bus_update_ignores_stale_sequence() {
        let mut mc = MemCache::new_empty("c0");
        mc.set_sequence(5);
        let mut msg = KvMessage::new(3);
        msg.set_key(b"k".to_vec());
        msg.set_body(b"v".to_vec());
        mc.apply_bus_update(msg).unwrap();
        assert!(mc.get("k").is_none());
        assert_eq!(mc.sequence(), 5);
    }

    #[test]
    fn ttld_updates_are_never_queued() {
        let mut mc = MemCache::new_empty("c0");
        let mut msg = KvMessage::new(0);
        msg.set_key(b"k".to_vec());
        msg.set_prop(crate::message::PROP_TTLD, "1");
        mc.apply_pending_update(msg);
        assert!(!mc.has_pending());
    }

    #[test]
    fn drain_pending_assigns_fresh_sequences_in_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut mc = MemCache::new_with_durable("c0", durable_in(&dir));

        let mut a = KvMessage::new(0);
        a.set_key(b"a".to_vec());
        a.set_body(b"1".to_vec());
        let mut b = KvMessage::new(0);
        b.set_key(b"b".to_vec());
        b.set_body(b"2".to_vec());

        mc.enqueue_pending(a);
        mc.enqueue_pending(b);

        let published = mc.drain_pending().unwrap();
        assert_eq!(published.len(), 2);
        assert!(published[0].sequence() < published[1].sequence());
        assert!(!mc.has_pending());
        assert_eq!(mc.get("a").unwrap().body(), b"1");
        assert_eq!(mc.get("b").unwrap().body(), b"2");
    }
}
