//! Persistence of the record cache.
//!
//! The cache is written as a JSON array of flat entries.  Only the
//! round-trip matters: whatever `save` writes, `load` restores, minus
//! entries which have expired in between.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use burrow_types::protocol::types::{
    DomainName, RecordType, RecordTypeWithData, ResourceRecord,
};

use crate::cache::{now_unix, CacheEntry, SharedCache};

impl SharedCache {
    /// Write every entry (including its insertion time) to a file.
    /// Returns the number of entries written.
    pub fn save(&self, path: &Path) -> Result<usize, Error> {
        let persisted = self
            .entries()
            .iter()
            .map(PersistedEntry::from_entry)
            .collect::<Vec<_>>();

        let data = serde_json::to_string_pretty(&persisted)?;
        fs::write(path, data)?;

        Ok(persisted.len())
    }

    /// Restore entries from a file, skipping any which have already
    /// expired.  Returns the number of entries restored.
    pub fn load(&self, path: &Path) -> Result<usize, Error> {
        let data = fs::read_to_string(path)?;
        let persisted: Vec<PersistedEntry> = serde_json::from_str(&data)?;

        let now = now_unix();
        let mut restored = 0;
        for entry in persisted {
            match entry.into_entry() {
                Some(entry) if entry.is_fresh(now) => {
                    self.restore(entry);
                    restored += 1;
                }
                Some(_) => (),
                None => tracing::warn!(?path, "skipping malformed cache entry"),
            }
        }

        Ok(restored)
    }
}

/// Errors encountered reading or writing the cache file.
#[derive(Debug)]
pub enum Error {
    IO(std::io::Error),
    Json(serde_json::Error),
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json(error)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::IO(error) => write!(f, "{error}"),
            Error::Json(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IO(error) => Some(error),
            Error::Json(error) => Some(error),
        }
    }
}

/// One cache entry, flattened for the file.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    name: String,
    rtype: u16,
    rclass: u16,
    ttl: u32,
    rdata: PersistedRData,
    added_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum PersistedRData {
    Address { address: Ipv4Addr },
    Name { name: String },
    Opaque { octets: Vec<u8> },
}

impl PersistedEntry {
    fn from_entry(entry: &CacheEntry) -> Self {
        let record = &entry.record;
        let rdata = match &record.rtype_with_data {
            RecordTypeWithData::A { address } => PersistedRData::Address { address: *address },
            RecordTypeWithData::NS { nsdname } => PersistedRData::Name {
                name: nsdname.to_dotted_string(),
            },
            RecordTypeWithData::CNAME { cname } => PersistedRData::Name {
                name: cname.to_dotted_string(),
            },
            RecordTypeWithData::PTR { ptrdname } => PersistedRData::Name {
                name: ptrdname.to_dotted_string(),
            },
            RecordTypeWithData::SOA { octets }
            | RecordTypeWithData::MX { octets }
            | RecordTypeWithData::TXT { octets }
            | RecordTypeWithData::AAAA { octets }
            | RecordTypeWithData::Unknown { octets, .. } => PersistedRData::Opaque {
                octets: octets.clone(),
            },
        };

        PersistedEntry {
            name: record.name.to_dotted_string(),
            rtype: record.rtype_with_data.rtype().into(),
            rclass: record.rclass.into(),
            ttl: record.ttl,
            rdata,
            added_at: entry.added_at,
        }
    }

    /// Rebuild the entry.  `None` if the rdata variant does not fit
    /// the type code, or a name does not parse.
    fn into_entry(self) -> Option<CacheEntry> {
        let name = DomainName::from_dotted_string(&self.name)?;

        let rtype_with_data = match (RecordType::from(self.rtype), self.rdata) {
            (RecordType::A, PersistedRData::Address { address }) => {
                RecordTypeWithData::A { address }
            }
            (RecordType::NS, PersistedRData::Name { name }) => RecordTypeWithData::NS {
                nsdname: DomainName::from_dotted_string(&name)?,
            },
            (RecordType::CNAME, PersistedRData::Name { name }) => RecordTypeWithData::CNAME {
                cname: DomainName::from_dotted_string(&name)?,
            },
            (RecordType::PTR, PersistedRData::Name { name }) => RecordTypeWithData::PTR {
                ptrdname: DomainName::from_dotted_string(&name)?,
            },
            (RecordType::SOA, PersistedRData::Opaque { octets }) => {
                RecordTypeWithData::SOA { octets }
            }
            (RecordType::MX, PersistedRData::Opaque { octets }) => {
                RecordTypeWithData::MX { octets }
            }
            (RecordType::TXT, PersistedRData::Opaque { octets }) => {
                RecordTypeWithData::TXT { octets }
            }
            (RecordType::AAAA, PersistedRData::Opaque { octets }) => {
                RecordTypeWithData::AAAA { octets }
            }
            (RecordType::Unknown(tag), PersistedRData::Opaque { octets }) => {
                RecordTypeWithData::Unknown { tag, octets }
            }
            _ => return None,
        };

        Some(CacheEntry {
            record: ResourceRecord {
                name,
                rtype_with_data,
                rclass: self.rclass.into(),
                ttl: self.ttl,
            },
            added_at: self.added_at,
        })
    }
}
