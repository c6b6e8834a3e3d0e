use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use burrow_types::protocol::types::{DomainName, RecordClass, RecordType, ResourceRecord};

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] cache mutex poisoned, cannot recover from this - aborting";

/// Seconds since the epoch.  Cache timestamps use wall-clock time,
/// not a monotonic clock, because they are persisted across runs.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A convenience wrapper around a `Cache` which lets it be shared
/// between tasks.
///
/// Invoking `clone` on a `SharedCache` gives a new instance which
/// refers to the same underlying `Cache` object.
#[derive(Debug, Clone)]
pub struct SharedCache {
    cache: Arc<Mutex<Cache>>,
}

impl SharedCache {
    /// Make a new, empty, shared cache.  If `ttl_override` is
    /// nonzero it replaces the TTL of every inserted record.
    pub fn new(ttl_override: u32) -> Self {
        SharedCache {
            cache: Arc::new(Mutex::new(Cache::new(ttl_override))),
        }
    }

    /// Find a fresh record matching the name, type, and class
    /// exactly, if there is one.  Expired entries encountered along
    /// the way are evicted.
    pub fn lookup(
        &self,
        name: &DomainName,
        rtype: RecordType,
        rclass: RecordClass,
    ) -> Option<ResourceRecord> {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .lookup(name, rtype, rclass, now_unix())
    }

    /// Insert a record, stamping it with the current time.
    pub fn add(&self, record: ResourceRecord) {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .add(record, now_unix());
    }

    /// Insert a batch of records.
    pub fn add_many(&self, records: &[ResourceRecord]) {
        let mut cache = self.cache.lock().expect(MUTEX_POISON_MESSAGE);
        let now = now_unix();
        for record in records {
            cache.add(record.clone(), now);
        }
    }

    /// A copy of every entry, fresh or not.  Used by persistence.
    pub(crate) fn entries(&self) -> Vec<CacheEntry> {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .entries
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Insert an already-stamped entry, preserving its insertion
    /// time.  Used by persistence.
    pub(crate) fn restore(&self, entry: CacheEntry) {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .restore(entry);
    }
}

impl Default for SharedCache {
    fn default() -> Self {
        Self::new(0)
    }
}

/// A record plus the time it entered the cache.  The record is fresh
/// while `now - added_at <= ttl`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct CacheEntry {
    pub record: ResourceRecord,
    pub added_at: u64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: u64) -> bool {
        now.saturating_sub(self.added_at) <= u64::from(self.record.ttl)
    }
}

/// Caching for `ResourceRecord`s, with lazy expiry: expired entries
/// are dropped by the lookups which scan over them, there is no
/// background sweep.
///
/// You probably want to use `SharedCache` instead.
#[derive(Debug, Clone)]
pub struct Cache {
    /// Cached entries, bucketed by owner name.
    entries: HashMap<DomainName, Vec<CacheEntry>>,

    /// If nonzero, replaces the TTL of every record on insertion.
    ttl_override: u32,
}

impl Cache {
    pub fn new(ttl_override: u32) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_override,
        }
    }

    /// Find a fresh record matching the key exactly.  The expired
    /// entries of the scanned bucket are removed.  If several fresh
    /// records match, the oldest-inserted one is returned.
    pub fn lookup(
        &mut self,
        name: &DomainName,
        rtype: RecordType,
        rclass: RecordClass,
        now: u64,
    ) -> Option<ResourceRecord> {
        let entries = self.entries.get_mut(name)?;
        entries.retain(|entry| entry.is_fresh(now));

        let found = entries
            .iter()
            .find(|entry| {
                entry.record.rtype_with_data.rtype() == rtype && entry.record.rclass == rclass
            })
            .map(|entry| entry.record.clone());

        if entries.is_empty() {
            self.entries.remove(name);
        }

        found
    }

    /// Insert a record with the given insertion time.
    ///
    /// The TTL override, when configured, is applied first.  Records
    /// whose (effective) TTL is zero are not cached at all.  A record
    /// equal to one already present replaces it, refreshing the
    /// insertion time.
    pub fn add(&mut self, mut record: ResourceRecord, now: u64) {
        if self.ttl_override > 0 {
            record.ttl = self.ttl_override;
        }
        if record.ttl == 0 {
            return;
        }

        let entries = self.entries.entry(record.name.clone()).or_default();
        entries.retain(|entry| entry.record != record);
        entries.push(CacheEntry {
            record,
            added_at: now,
        });
    }

    fn restore(&mut self, entry: CacheEntry) {
        self.entries
            .entry(entry.record.name.clone())
            .or_default()
            .push(entry);
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use burrow_types::protocol::types::test_util::*;

    use super::*;

    #[test]
    fn add_then_lookup_returns_the_record() {
        let mut cache = Cache::new(0);
        let rr = a_record("www.gumpe.", Ipv4Addr::new(10, 0, 1, 7));

        cache.add(rr.clone(), 100);

        assert_eq!(
            Some(rr),
            cache.lookup(&domain("www.gumpe."), RecordType::A, RecordClass::IN, 100)
        );
    }

    #[test]
    fn lookup_matches_name_type_and_class_exactly() {
        let mut cache = Cache::new(0);
        cache.add(a_record("www.gumpe.", Ipv4Addr::new(10, 0, 1, 7)), 100);

        assert_eq!(
            None,
            cache.lookup(&domain("www.gumpe."), RecordType::NS, RecordClass::IN, 100)
        );
        assert_eq!(
            None,
            cache.lookup(
                &domain("www.gumpe."),
                RecordType::A,
                RecordClass::from(3),
                100
            )
        );
        assert_eq!(
            None,
            cache.lookup(&domain("other.gumpe."), RecordType::A, RecordClass::IN, 100)
        );
    }

    #[test]
    fn lookup_is_fresh_until_exactly_ttl_seconds() {
        let mut cache = Cache::new(0);
        let rr = a_record("www.gumpe.", Ipv4Addr::new(10, 0, 1, 7));
        // the helper record has ttl 300
        cache.add(rr.clone(), 1000);

        assert_eq!(
            Some(rr),
            cache.lookup(&domain("www.gumpe."), RecordType::A, RecordClass::IN, 1300)
        );
        assert_eq!(
            None,
            cache.lookup(&domain("www.gumpe."), RecordType::A, RecordClass::IN, 1301)
        );
    }

    #[test]
    fn ttl_zero_records_are_never_returned() {
        let mut cache = Cache::new(0);
        let mut rr = a_record("www.gumpe.", Ipv4Addr::new(10, 0, 1, 7));
        rr.ttl = 0;
        cache.add(rr, 100);

        assert_eq!(
            None,
            cache.lookup(&domain("www.gumpe."), RecordType::A, RecordClass::IN, 100)
        );
    }

    #[test]
    fn ttl_override_rewrites_the_stored_ttl() {
        let mut cache = Cache::new(60);
        let mut rr = a_record("www.gumpe.", Ipv4Addr::new(10, 0, 1, 7));
        rr.ttl = 3600;
        cache.add(rr, 100);

        let found = cache
            .lookup(&domain("www.gumpe."), RecordType::A, RecordClass::IN, 100)
            .unwrap();
        assert_eq!(60, found.ttl);

        // and the override governs expiry too
        assert_eq!(
            None,
            cache.lookup(&domain("www.gumpe."), RecordType::A, RecordClass::IN, 161)
        );
    }

    #[test]
    fn ttl_override_applies_to_ttl_zero_records() {
        let mut cache = Cache::new(60);
        let mut rr = a_record("www.gumpe.", Ipv4Addr::new(10, 0, 1, 7));
        rr.ttl = 0;
        cache.add(rr, 100);

        assert!(cache
            .lookup(&domain("www.gumpe."), RecordType::A, RecordClass::IN, 100)
            .is_some());
    }

    #[test]
    fn lookup_evicts_expired_entries_it_scans() {
        let mut cache = Cache::new(0);
        cache.add(a_record("www.gumpe.", Ipv4Addr::new(10, 0, 1, 7)), 100);
        cache.add(cname_record("www.gumpe.", "server2.gumpe."), 100);

        assert_eq!(
            None,
            cache.lookup(&domain("www.gumpe."), RecordType::A, RecordClass::IN, 9999)
        );
        assert!(cache.entries.is_empty());
    }

    #[test]
    fn duplicate_add_refreshes_the_stamp() {
        let mut cache = Cache::new(0);
        let rr = a_record("www.gumpe.", Ipv4Addr::new(10, 0, 1, 7));

        cache.add(rr.clone(), 100);
        cache.add(rr.clone(), 500);

        assert_eq!(1, cache.entries[&domain("www.gumpe.")].len());
        assert_eq!(
            Some(rr),
            cache.lookup(&domain("www.gumpe."), RecordType::A, RecordClass::IN, 700)
        );
    }

    #[test]
    fn multiple_fresh_matches_return_the_oldest_inserted() {
        let mut cache = Cache::new(0);
        let first = a_record("www.gumpe.", Ipv4Addr::new(1, 1, 1, 1));
        let second = a_record("www.gumpe.", Ipv4Addr::new(2, 2, 2, 2));

        cache.add(first.clone(), 100);
        cache.add(second, 100);

        assert_eq!(
            Some(first),
            cache.lookup(&domain("www.gumpe."), RecordType::A, RecordClass::IN, 100)
        );
    }

    #[test]
    fn shared_cache_is_usable_from_many_threads() {
        let cache = SharedCache::new(0);
        let mut handles = Vec::new();

        for i in 0..8u8 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                let name = format!("host{i}.gumpe.");
                for _ in 0..100 {
                    cache.add(a_record(&name, Ipv4Addr::new(10, 0, 0, i)));
                    cache.lookup(&domain(&name), RecordType::A, RecordClass::IN);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..8u8 {
            assert!(cache
                .lookup(
                    &domain(&format!("host{i}.gumpe.")),
                    RecordType::A,
                    RecordClass::IN
                )
                .is_some());
        }
    }
}
