//! Parsing of master zone files.
//!
//! The accepted format is a line-oriented subset of RFC 1035 section
//! 5: one record per line, no `$ORIGIN`/`$INCLUDE`, no parentheses.
//! Lines which do not look like records (comments, blanks) are
//! skipped.

use std::net::Ipv4Addr;
use std::str::FromStr;

use regex::Regex;

use crate::protocol::types::{
    DomainName, RecordClass, RecordType, RecordTypeWithData, ResourceRecord,
};
use crate::zones::types::{prefix_string, Zone};

/// One record: owner, optional TTL, optional class, type, rdata.
/// TTL defaults to 0 ("do not cache"), class to IN.
const RECORD_PATTERN: &str = r"(?m)^((?:\w+\.?)+)\s+(?:(\d+)\s+)?(?:(\w+)\s+)?(\w+)\s+([\w.]+)";

impl Zone {
    /// Parse master-file text into a zone under the given apex.
    ///
    /// Owner names and name-valued rdata are taken relative to the
    /// apex unless they end with a dot; dot-terminated owners must
    /// still lie inside the zone.
    ///
    /// # Errors
    ///
    /// If a record-shaped line cannot be turned into a record.
    pub fn from_master_data(apex: DomainName, data: &str) -> Result<Self, Error> {
        let mut zone = Zone::new(apex.clone());

        // the pattern is a fixed string, so compilation cannot fail
        let pattern = Regex::new(RECORD_PATTERN).unwrap();

        for captures in pattern.captures_iter(data) {
            let owner_token = &captures[1];
            let ttl_token = captures.get(2).map(|m| m.as_str());
            let class_token = captures.get(3).map(|m| m.as_str());
            let type_token = &captures[4];
            let rdata_token = &captures[5];

            let name = DomainName::from_relative_dotted_string(&apex, owner_token).ok_or_else(
                || Error::BadOwner {
                    owner: owner_token.to_string(),
                },
            )?;
            if !name.is_subdomain_of(&apex) {
                return Err(Error::OwnerNotInZone {
                    owner: name,
                    apex: apex.clone(),
                });
            }

            let ttl = match ttl_token {
                Some(token) => token.parse().map_err(|_| Error::BadTtl {
                    ttl: token.to_string(),
                })?,
                None => 0,
            };

            let rclass = match class_token {
                Some(token) => {
                    RecordClass::from_str(token).map_err(|_| Error::UnknownClass {
                        class: token.to_string(),
                    })?
                }
                None => RecordClass::IN,
            };

            let rtype = RecordType::from_str(type_token).map_err(|_| Error::UnknownType {
                rtype: type_token.to_string(),
            })?;
            let rtype_with_data = parse_rdata(&apex, rtype, rdata_token)?;

            let split = name.labels.len() - apex.labels.len();
            let owner = prefix_string(&name.labels[..split]);

            zone.insert(
                &owner,
                ResourceRecord {
                    name,
                    rtype_with_data,
                    rclass,
                    ttl,
                },
            );
        }

        Ok(zone)
    }
}

/// Parse the single-token rdata column.  Only types whose rdata fits
/// in one token are expressible in this format.
fn parse_rdata(
    apex: &DomainName,
    rtype: RecordType,
    token: &str,
) -> Result<RecordTypeWithData, Error> {
    match rtype {
        RecordType::A => {
            let address = Ipv4Addr::from_str(token).map_err(|_| Error::BadAddress {
                address: token.to_string(),
            })?;
            Ok(RecordTypeWithData::A { address })
        }
        RecordType::NS => Ok(RecordTypeWithData::NS {
            nsdname: rdata_name(apex, token)?,
        }),
        RecordType::CNAME => Ok(RecordTypeWithData::CNAME {
            cname: rdata_name(apex, token)?,
        }),
        RecordType::PTR => Ok(RecordTypeWithData::PTR {
            ptrdname: rdata_name(apex, token)?,
        }),
        RecordType::TXT => Ok(RecordTypeWithData::TXT {
            octets: token.as_bytes().to_vec(),
        }),
        _ => Err(Error::UnsupportedType { rtype }),
    }
}

fn rdata_name(apex: &DomainName, token: &str) -> Result<DomainName, Error> {
    DomainName::from_relative_dotted_string(apex, token).ok_or_else(|| Error::BadName {
        name: token.to_string(),
    })
}

/// Errors encountered when parsing a master file.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// The owner column is not a valid domain name.
    BadOwner { owner: String },

    /// A dot-terminated owner lies outside the zone.
    OwnerNotInZone { owner: DomainName, apex: DomainName },

    /// The TTL column does not fit in 32 bits.
    BadTtl { ttl: String },

    /// The class mnemonic is not recognised.
    UnknownClass { class: String },

    /// The type mnemonic is not recognised.
    UnknownType { rtype: String },

    /// The type is recognised but its rdata cannot be written in the
    /// single-token record format.
    UnsupportedType { rtype: RecordType },

    /// An A record's rdata is not a dotted quad.
    BadAddress { address: String },

    /// A name-valued rdata column is not a valid domain name.
    BadName { name: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::BadOwner { owner } => write!(f, "bad owner name '{owner}'"),
            Error::OwnerNotInZone { owner, apex } => {
                write!(f, "owner '{owner}' is outside zone '{apex}'")
            }
            Error::BadTtl { ttl } => write!(f, "bad ttl '{ttl}'"),
            Error::UnknownClass { class } => write!(f, "unknown class '{class}'"),
            Error::UnknownType { rtype } => write!(f, "unknown record type '{rtype}'"),
            Error::UnsupportedType { rtype } => {
                write!(f, "record type '{rtype}' cannot appear in a zone file")
            }
            Error::BadAddress { address } => write!(f, "bad address '{address}'"),
            Error::BadName { name } => write!(f, "bad domain name '{name}'"),
        }
    }
}

impl std::error::Error for Error {}
