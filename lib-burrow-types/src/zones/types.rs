use std::collections::HashMap;

use crate::protocol::types::{DomainName, RecordTypeWithData, ResourceRecord};

/// How many in-zone CNAME targets a single lookup will chase.
pub const CNAME_CHASE_LIMIT: usize = 8;

/// The set of zones this server is authoritative for, indexed by
/// apex.  Built once at startup and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    zones: HashMap<DomainName, Zone>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a zone under its apex, replacing any previous zone
    /// with the same apex.
    pub fn insert(&mut self, zone: Zone) {
        self.zones.insert(zone.apex().clone(), zone);
    }

    /// Answer a query from the catalog.
    ///
    /// This corresponds to step 2 of the standard nameserver
    /// algorithm (section 4.3.2 of RFC 1034): walk the suffixes of
    /// the query name, longest first, looking for an apex we own.
    ///
    /// Returns `(authoritative, records)`:
    ///
    /// - `(true, Some(rrs))` - we own the name and have records.
    /// - `(true, None)` - we own the enclosing zone but the name has
    ///   no records: a name error.
    /// - `(false, None)` - no zone of ours encloses the name; the
    ///   caller falls through to cache or recursion.
    pub fn lookup(&self, qname: &DomainName) -> (bool, Option<Vec<ResourceRecord>>) {
        for i in 0..qname.labels.len() {
            let Some(apex) = DomainName::from_labels(qname.labels[i..].to_vec()) else {
                continue;
            };
            if let Some(zone) = self.zones.get(&apex) {
                let owner = prefix_string(&qname.labels[..i]);
                return (true, zone.lookup(&owner));
            }
        }

        (false, None)
    }
}

/// The records of one zone, indexed by owner prefix relative to the
/// apex (the empty string for the apex itself).  The records
/// themselves carry fully-qualified owner names.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Zone {
    apex: DomainName,
    records: HashMap<String, Vec<ResourceRecord>>,
}

impl Zone {
    pub fn new(apex: DomainName) -> Self {
        Self {
            apex,
            records: HashMap::new(),
        }
    }

    pub fn apex(&self) -> &DomainName {
        &self.apex
    }

    /// Total number of records.
    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    /// Add a record under an owner prefix.  Identical records are
    /// inserted only once.
    pub fn insert(&mut self, owner: &str, rr: ResourceRecord) {
        let entries = self.records.entry(owner.to_string()).or_default();
        if !entries.contains(&rr) {
            entries.push(rr);
        }
    }

    /// Fetch the records for an owner prefix, expanding in-zone CNAME
    /// targets: the CNAME record itself comes first, then the records
    /// of the canonical name.  At most `CNAME_CHASE_LIMIT` targets
    /// are chased, and records are never emitted twice, so a CNAME
    /// loop inside the zone terminates.
    pub fn lookup(&self, owner: &str) -> Option<Vec<ResourceRecord>> {
        let mut out = self.records.get(owner)?.clone();

        let mut hops = 0;
        let mut i = 0;
        while i < out.len() {
            let target = match &out[i].rtype_with_data {
                RecordTypeWithData::CNAME { cname } => Some(cname.clone()),
                _ => None,
            };
            i += 1;

            if let Some(cname) = target {
                if hops == CNAME_CHASE_LIMIT {
                    break;
                }
                hops += 1;

                if let Some(target_owner) = self.relative_owner(&cname) {
                    if let Some(more) = self.records.get(&target_owner) {
                        for rr in more {
                            if !out.contains(rr) {
                                out.push(rr.clone());
                            }
                        }
                    }
                }
            }
        }

        Some(out)
    }

    /// The owner prefix of a name relative to this zone's apex, or
    /// `None` if the name is outside the zone.
    fn relative_owner(&self, name: &DomainName) -> Option<String> {
        if name.is_subdomain_of(&self.apex) {
            let split = name.labels.len() - self.apex.labels.len();
            Some(prefix_string(&name.labels[..split]))
        } else {
            None
        }
    }
}

/// Join labels into a dotted prefix string, with no trailing dot.
pub(crate) fn prefix_string(labels: &[Vec<u8>]) -> String {
    let mut out = String::new();
    for (i, label) in labels.iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        for octet in label {
            out.push(*octet as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::protocol::types::test_util::*;

    fn fixture_catalog() -> Catalog {
        let mut zone = Zone::new(domain("gumpe."));
        zone.insert("server1", a_record("server1.gumpe.", Ipv4Addr::new(10, 0, 1, 5)));
        zone.insert("server1", a_record("server1.gumpe.", Ipv4Addr::new(10, 0, 1, 4)));
        zone.insert("server2", a_record("server2.gumpe.", Ipv4Addr::new(10, 0, 1, 7)));
        zone.insert("www", cname_record("www.gumpe.", "server2.gumpe."));

        let mut catalog = Catalog::new();
        catalog.insert(zone);
        catalog
    }

    #[test]
    fn lookup_returns_all_records_for_owner() {
        let (authoritative, records) = fixture_catalog().lookup(&domain("server1.gumpe."));

        assert!(authoritative);
        assert_eq!(
            Some(vec![
                a_record("server1.gumpe.", Ipv4Addr::new(10, 0, 1, 5)),
                a_record("server1.gumpe.", Ipv4Addr::new(10, 0, 1, 4)),
            ]),
            records
        );
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let (authoritative, records) = fixture_catalog().lookup(&domain("SERVER1.Gumpe."));

        assert!(authoritative);
        assert_eq!(2, records.unwrap().len());
    }

    #[test]
    fn lookup_expands_cname_target_after_the_cname() {
        let (authoritative, records) = fixture_catalog().lookup(&domain("www.gumpe."));

        assert!(authoritative);
        assert_eq!(
            Some(vec![
                cname_record("www.gumpe.", "server2.gumpe."),
                a_record("server2.gumpe.", Ipv4Addr::new(10, 0, 1, 7)),
            ]),
            records
        );
    }

    #[test]
    fn lookup_missing_name_in_zone_is_authoritative_none() {
        let (authoritative, records) = fixture_catalog().lookup(&domain("nothere.gumpe."));

        assert!(authoritative);
        assert_eq!(None, records);
    }

    #[test]
    fn lookup_apex_with_no_records_is_authoritative_none() {
        let (authoritative, records) = fixture_catalog().lookup(&domain("gumpe."));

        assert!(authoritative);
        assert_eq!(None, records);
    }

    #[test]
    fn lookup_outside_all_zones_is_not_authoritative() {
        let (authoritative, records) = fixture_catalog().lookup(&domain("gaia.cs.umass.edu."));

        assert!(!authoritative);
        assert_eq!(None, records);
    }

    #[test]
    fn lookup_terminates_on_cname_loop() {
        let mut zone = Zone::new(domain("gumpe."));
        zone.insert("a", cname_record("a.gumpe.", "b.gumpe."));
        zone.insert("b", cname_record("b.gumpe.", "a.gumpe."));

        let mut catalog = Catalog::new();
        catalog.insert(zone);

        let (authoritative, records) = catalog.lookup(&domain("a.gumpe."));
        assert!(authoritative);
        assert_eq!(
            Some(vec![
                cname_record("a.gumpe.", "b.gumpe."),
                cname_record("b.gumpe.", "a.gumpe."),
            ]),
            records
        );
    }

    #[test]
    fn lookup_ignores_out_of_zone_cname_target() {
        let mut zone = Zone::new(domain("gumpe."));
        zone.insert("www", cname_record("www.gumpe.", "www.example.com."));

        let mut catalog = Catalog::new();
        catalog.insert(zone);

        let (authoritative, records) = catalog.lookup(&domain("www.gumpe."));
        assert!(authoritative);
        assert_eq!(
            Some(vec![cname_record("www.gumpe.", "www.example.com.")]),
            records
        );
    }

    #[test]
    fn insert_deduplicates_identical_records() {
        let mut zone = Zone::new(domain("gumpe."));
        zone.insert("server1", a_record("server1.gumpe.", Ipv4Addr::new(10, 0, 1, 5)));
        zone.insert("server1", a_record("server1.gumpe.", Ipv4Addr::new(10, 0, 1, 5)));

        assert_eq!(1, zone.record_count());
    }

    #[test]
    fn longest_apex_wins() {
        let mut outer = Zone::new(domain("gumpe."));
        outer.insert("server1", a_record("server1.gumpe.", Ipv4Addr::new(1, 1, 1, 1)));
        let mut inner = Zone::new(domain("sub.gumpe."));
        inner.insert("www", a_record("www.sub.gumpe.", Ipv4Addr::new(2, 2, 2, 2)));

        let mut catalog = Catalog::new();
        catalog.insert(outer);
        catalog.insert(inner);

        let (authoritative, records) = catalog.lookup(&domain("www.sub.gumpe."));
        assert!(authoritative);
        assert_eq!(
            Some(vec![a_record("www.sub.gumpe.", Ipv4Addr::new(2, 2, 2, 2))]),
            records
        );
    }
}
