//! Recursive resolution, corresponding to the standard resolver
//! algorithm of RFC 1034 section 5.3.3: answer from local
//! information if possible, otherwise walk the referral graph from
//! the root nameservers until a server returns an answer or an
//! error.

use async_recursion::async_recursion;
use rand::Rng;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use burrow_types::protocol::types::*;

use crate::cache::SharedCache;
use crate::util::net::{send_udp_bytes, DNS_PORT, MAX_UDP_PAYLOAD};

/// h.root-servers.net
pub const ROOT_SERVER: Ipv4Addr = Ipv4Addr::new(198, 97, 190, 53);

/// How many CNAMEs a single resolution will follow.  Bounds alias
/// cycles in the cache and in upstream answers.
pub const CNAME_HOP_LIMIT: usize = 16;

/// How many referrals a single resolution will follow.
pub const REFERRAL_LIMIT: usize = 20;

/// The result of a name resolution attempt.  There is no error case:
/// a resolution which cannot complete has an empty address list.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HostLookup {
    /// The name the addresses belong to, after following aliases.
    pub canonical: DomainName,

    /// The alias names encountered on the way, oldest first.
    pub aliases: Vec<DomainName>,

    /// The IPv4 addresses of the canonical name.
    pub addresses: Vec<Ipv4Addr>,
}

impl HostLookup {
    fn empty(host: DomainName) -> Self {
        Self {
            canonical: host,
            aliases: Vec::new(),
            addresses: Vec::new(),
        }
    }
}

/// An iterative resolver: it sends non-recursive queries (RD unset)
/// to authoritative nameservers, following referrals itself.
#[derive(Debug, Clone)]
pub struct Resolver {
    /// Per-exchange UDP timeout.
    timeout: Duration,

    /// Where to start the walk.
    roots: Vec<Ipv4Addr>,

    /// The port upstream nameservers listen on.
    upstream_port: u16,

    /// Answers are written back here, and resolutions try here
    /// before touching the network.
    cache: Option<SharedCache>,
}

impl Resolver {
    pub fn new(timeout: Duration, cache: Option<SharedCache>) -> Self {
        Self {
            timeout,
            roots: vec![ROOT_SERVER],
            upstream_port: DNS_PORT,
            cache,
        }
    }

    /// Replace the root hints.
    pub fn with_roots(mut self, roots: Vec<Ipv4Addr>) -> Self {
        self.roots = roots;
        self
    }

    /// Query upstream nameservers on a non-standard port.
    pub fn with_upstream_port(mut self, port: u16) -> Self {
        self.upstream_port = port;
        self
    }

    /// The wall-clock bound on one whole resolution.
    #[allow(clippy::cast_possible_truncation)]
    fn overall_timeout(&self) -> Duration {
        self.timeout.saturating_mul(REFERRAL_LIMIT as u32)
    }

    /// Translate a host name to IPv4 addresses.
    ///
    /// Checks the cache first (following cached CNAMEs), then walks
    /// the referral graph.  Failure is signalled by an empty address
    /// list, never by an error.
    pub async fn gethostbyname(&self, host: &DomainName) -> HostLookup {
        match timeout(
            self.overall_timeout(),
            self.gethostbyname_inner(host.clone(), REFERRAL_LIMIT),
        )
        .await
        {
            Ok(found) => found,
            Err(_) => {
                tracing::debug!(%host, "resolution timed out");
                HostLookup::empty(host.clone())
            }
        }
    }

    /// The referral walk alone, without the cache-first step: query
    /// nameservers starting at the roots and return the answer
    /// section of the terminal response.  Used by the server's
    /// dispatch path, which does its own cache lookup.  Returns no
    /// records on failure.
    pub async fn lookup(&self, qname: &DomainName) -> Vec<ResourceRecord> {
        match timeout(self.overall_timeout(), self.walk(qname, REFERRAL_LIMIT)).await {
            Ok(answers) => answers,
            Err(_) => {
                tracing::debug!(%qname, "resolution timed out");
                Vec::new()
            }
        }
    }

    #[async_recursion]
    async fn gethostbyname_inner(&self, host: DomainName, depth: usize) -> HostLookup {
        let mut qname = host;
        let mut aliases = Vec::new();
        let mut addresses = Vec::new();

        // step 1: local information
        if let Some(cache) = &self.cache {
            for _ in 0..CNAME_HOP_LIMIT {
                if let Some(rr) = cache.lookup(&qname, RecordType::A, RecordClass::IN) {
                    if let RecordTypeWithData::A { address } = rr.rtype_with_data {
                        addresses.push(address);
                    }
                }
                match cache.lookup(&qname, RecordType::CNAME, RecordClass::IN) {
                    Some(ResourceRecord {
                        rtype_with_data: RecordTypeWithData::CNAME { cname },
                        ..
                    }) => {
                        aliases.push(qname);
                        qname = cname;
                    }
                    _ => break,
                }
            }

            if !addresses.is_empty() {
                tracing::debug!(host = %qname, "answered from cache");
                return HostLookup {
                    canonical: qname,
                    aliases,
                    addresses,
                };
            }
        }

        // steps 2-4: ask the network
        let answers = self.walk(&qname, depth).await;
        let canonical = collect_answers(qname, &answers, &mut aliases, &mut addresses);

        HostLookup {
            canonical,
            aliases,
            addresses,
        }
    }

    /// Walk the referral graph depth-first from the root hints.
    ///
    /// Candidate server addresses live on a stack, so a referral's
    /// servers are tried before the untried servers of earlier
    /// levels, in the order the referral listed them.
    #[async_recursion]
    async fn walk(&self, qname: &DomainName, depth: usize) -> Vec<ResourceRecord> {
        let mut frontier: Vec<Ipv4Addr> = self.roots.iter().rev().copied().collect();
        let mut referrals = depth;

        while let Some(server) = frontier.pop() {
            let Some(response) = self.exchange(qname, server).await else {
                // timed out or unusable: try the next candidate
                continue;
            };

            if response.header.rcode == Rcode::NoError {
                self.cache_response(&response);
            }

            if !response.answers.is_empty() || response.header.rcode != Rcode::NoError {
                tracing::debug!(
                    %qname,
                    %server,
                    rcode = ?response.header.rcode,
                    answers = %response.answers.len(),
                    "terminal response"
                );
                return response.answers;
            }

            if referrals == 0 {
                tracing::debug!(%qname, "referral limit reached");
                break;
            }
            referrals -= 1;

            let glue = glue_addresses(&response);
            if glue.is_empty() {
                // a referral without glue: resolve the nameserver
                // names themselves before continuing
                let mut resolved = Vec::new();
                for nsdname in nameserver_names(&response) {
                    let found = self.gethostbyname_inner(nsdname, referrals).await;
                    resolved.extend(found.addresses);
                }
                for address in resolved.into_iter().rev() {
                    frontier.push(address);
                }
            } else {
                for address in glue.into_iter().rev() {
                    frontier.push(address);
                }
            }
        }

        Vec::new()
    }

    /// One query/response exchange with one server.  Returns `None`
    /// on timeout, on an undecodable reply, or on a reply which does
    /// not match the query.
    async fn exchange(&self, qname: &DomainName, server: Ipv4Addr) -> Option<Message> {
        let question = Question {
            name: qname.clone(),
            qtype: RecordType::A,
            qclass: RecordClass::IN,
        };
        let request = Message::from_question(rand::thread_rng().gen(), question);

        let mut serialised = match request.clone().into_octets() {
            Ok(octets) => octets,
            Err(error) => {
                tracing::warn!(message = ?request, ?error, "could not serialise query");
                return None;
            }
        };

        let target = (server, self.upstream_port);
        match timeout(self.timeout, exchange_notimeout(target, &mut serialised)).await {
            Ok(Some(response)) if response_matches_request(&request, &response) => Some(response),
            Ok(_) => {
                tracing::debug!(%qname, %server, "unusable response");
                None
            }
            Err(_) => {
                tracing::debug!(%qname, %server, "nameserver timed out");
                None
            }
        }
    }

    /// Remember every A, CNAME, and NS record of a response, from all
    /// three sections.  Only called for rcode-0 responses: failures
    /// and name errors are never cached.
    fn cache_response(&self, response: &Message) {
        let Some(cache) = &self.cache else { return };

        for rr in response
            .answers
            .iter()
            .chain(&response.authority)
            .chain(&response.additional)
        {
            match rr.rtype_with_data.rtype() {
                RecordType::A | RecordType::CNAME | RecordType::NS => cache.add(rr.clone()),
                _ => (),
            }
        }
    }
}

/// Timeout-less part of `exchange`.
async fn exchange_notimeout(target: (Ipv4Addr, u16), serialised: &mut [u8]) -> Option<Message> {
    let sock = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    sock.connect(target).await.ok()?;
    send_udp_bytes(&sock, serialised).await.ok()?;

    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    let len = sock.recv(&mut buf).await.ok()?;
    Message::from_octets(&buf[..len]).ok()
}

/// Pull the resolution result out of a terminal answer section:
/// every A record's address, and every CNAME as an alias of the
/// current query name.  Returns the final query name.
fn collect_answers(
    mut qname: DomainName,
    answers: &[ResourceRecord],
    aliases: &mut Vec<DomainName>,
    addresses: &mut Vec<Ipv4Addr>,
) -> DomainName {
    for rr in answers {
        match &rr.rtype_with_data {
            RecordTypeWithData::A { address } => addresses.push(*address),
            RecordTypeWithData::CNAME { cname } => {
                aliases.push(qname);
                qname = cname.clone();
            }
            _ => (),
        }
    }
    qname
}

/// The glue: every A record address in the additional section, in
/// order.
pub fn glue_addresses(response: &Message) -> Vec<Ipv4Addr> {
    response
        .additional
        .iter()
        .filter_map(|rr| match &rr.rtype_with_data {
            RecordTypeWithData::A { address } => Some(*address),
            _ => None,
        })
        .collect()
}

/// The names of the delegated-to nameservers: every NS record in the
/// authority section, in order.
pub fn nameserver_names(response: &Message) -> Vec<DomainName> {
    response
        .authority
        .iter()
        .filter_map(|rr| match &rr.rtype_with_data {
            RecordTypeWithData::NS { nsdname } => Some(nsdname.clone()),
            _ => None,
        })
        .collect()
}

/// Check a reply against the query: the ID must match, it must be a
/// response, and the opcode must agree.  Anything else (including a
/// nonzero rcode) is for the caller to interpret.
fn response_matches_request(request: &Message, response: &Message) -> bool {
    request.header.id == response.header.id
        && response.header.is_response
        && request.header.opcode == response.header.opcode
}

#[cfg(test)]
mod tests {
    use burrow_types::protocol::types::test_util::*;

    use super::*;

    fn no_network_resolver(cache: Option<SharedCache>) -> Resolver {
        Resolver::new(Duration::from_millis(50), cache).with_roots(Vec::new())
    }

    /// A nameserver which serves a fixed sequence of replies, one per
    /// request, echoing the request ID.
    enum CannedReply {
        Answer(Vec<ResourceRecord>),
        Referral {
            authority: Vec<ResourceRecord>,
            additional: Vec<ResourceRecord>,
        },
        NameError,
    }

    async fn spawn_nameserver(replies: Vec<CannedReply>) -> (Vec<Ipv4Addr>, u16) {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = sock.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let mut replies = replies.into_iter();
            loop {
                let Ok((len, peer)) = sock.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(request) = Message::from_octets(&buf[..len]) else {
                    continue;
                };
                let Some(reply) = replies.next() else {
                    break;
                };

                let mut response = request.make_response();
                match reply {
                    CannedReply::Answer(rrs) => response.answers = rrs,
                    CannedReply::Referral {
                        authority,
                        additional,
                    } => {
                        response.authority = authority;
                        response.additional = additional;
                    }
                    CannedReply::NameError => response.header.rcode = Rcode::NameError,
                }

                let octets = response.into_octets().unwrap();
                let _ = sock.send_to(&octets, peer).await;
            }
        });

        (vec![Ipv4Addr::LOCALHOST], port)
    }

    #[tokio::test]
    async fn walk_returns_terminal_answer() {
        let (roots, port) = spawn_nameserver(vec![CannedReply::Answer(vec![a_record(
            "host.gumpe.",
            Ipv4Addr::new(10, 9, 8, 7),
        )])])
        .await;
        let resolver = Resolver::new(Duration::from_secs(1), None)
            .with_roots(roots)
            .with_upstream_port(port);

        let found = resolver.gethostbyname(&domain("host.gumpe.")).await;

        assert_eq!(domain("host.gumpe."), found.canonical);
        assert!(found.aliases.is_empty());
        assert_eq!(vec![Ipv4Addr::new(10, 9, 8, 7)], found.addresses);
    }

    #[tokio::test]
    async fn walk_follows_glued_referral() {
        // the first reply delegates to a nameserver whose glue points
        // back at the same fake server, which then answers
        let (roots, port) = spawn_nameserver(vec![
            CannedReply::Referral {
                authority: vec![ns_record("gumpe.", "ns1.gumpe.")],
                additional: vec![a_record("ns1.gumpe.", Ipv4Addr::LOCALHOST)],
            },
            CannedReply::Answer(vec![a_record("host.gumpe.", Ipv4Addr::new(10, 9, 8, 7))]),
        ])
        .await;
        let resolver = Resolver::new(Duration::from_secs(1), None)
            .with_roots(roots)
            .with_upstream_port(port);

        let found = resolver.gethostbyname(&domain("host.gumpe.")).await;

        assert_eq!(vec![Ipv4Addr::new(10, 9, 8, 7)], found.addresses);
    }

    #[tokio::test]
    async fn walk_extracts_cname_chain_from_answer() {
        let (roots, port) = spawn_nameserver(vec![CannedReply::Answer(vec![
            cname_record("www.gumpe.", "server2.gumpe."),
            a_record("server2.gumpe.", Ipv4Addr::new(10, 0, 1, 7)),
        ])])
        .await;
        let resolver = Resolver::new(Duration::from_secs(1), None)
            .with_roots(roots)
            .with_upstream_port(port);

        let found = resolver.gethostbyname(&domain("www.gumpe.")).await;

        assert_eq!(domain("server2.gumpe."), found.canonical);
        assert_eq!(vec![domain("www.gumpe.")], found.aliases);
        assert_eq!(vec![Ipv4Addr::new(10, 0, 1, 7)], found.addresses);
    }

    #[tokio::test]
    async fn name_error_is_terminal_and_empty() {
        let (roots, port) = spawn_nameserver(vec![CannedReply::NameError]).await;
        let resolver = Resolver::new(Duration::from_secs(1), None)
            .with_roots(roots)
            .with_upstream_port(port);

        let found = resolver.gethostbyname(&domain("nothere.gumpe.")).await;

        assert_eq!(domain("nothere.gumpe."), found.canonical);
        assert!(found.addresses.is_empty());
    }

    #[tokio::test]
    async fn successful_responses_feed_the_cache() {
        let cache = SharedCache::new(0);
        let (roots, port) = spawn_nameserver(vec![
            CannedReply::Referral {
                authority: vec![ns_record("gumpe.", "ns1.gumpe.")],
                additional: vec![a_record("ns1.gumpe.", Ipv4Addr::LOCALHOST)],
            },
            CannedReply::Answer(vec![a_record("host.gumpe.", Ipv4Addr::new(10, 9, 8, 7))]),
        ])
        .await;
        let resolver = Resolver::new(Duration::from_secs(1), Some(cache.clone()))
            .with_roots(roots)
            .with_upstream_port(port);

        resolver.gethostbyname(&domain("host.gumpe.")).await;

        assert_eq!(
            Some(a_record("host.gumpe.", Ipv4Addr::new(10, 9, 8, 7))),
            cache.lookup(&domain("host.gumpe."), RecordType::A, RecordClass::IN)
        );
        // the delegation was remembered too
        assert_eq!(
            Some(ns_record("gumpe.", "ns1.gumpe.")),
            cache.lookup(&domain("gumpe."), RecordType::NS, RecordClass::IN)
        );
    }

    #[tokio::test]
    async fn cached_address_answers_without_network() {
        let cache = SharedCache::new(0);
        cache.add(a_record("host.gumpe.", Ipv4Addr::new(10, 9, 8, 7)));

        // no roots: touching the network would come back empty
        let resolver = no_network_resolver(Some(cache));
        let found = resolver.gethostbyname(&domain("host.gumpe.")).await;

        assert_eq!(domain("host.gumpe."), found.canonical);
        assert!(found.aliases.is_empty());
        assert_eq!(vec![Ipv4Addr::new(10, 9, 8, 7)], found.addresses);
    }

    #[tokio::test]
    async fn cached_cname_chain_is_followed() {
        let cache = SharedCache::new(0);
        cache.add(cname_record("www.gumpe.", "server2.gumpe."));
        cache.add(a_record("server2.gumpe.", Ipv4Addr::new(10, 0, 1, 7)));

        let resolver = no_network_resolver(Some(cache));
        let found = resolver.gethostbyname(&domain("www.gumpe.")).await;

        assert_eq!(domain("server2.gumpe."), found.canonical);
        assert_eq!(vec![domain("www.gumpe.")], found.aliases);
        assert_eq!(vec![Ipv4Addr::new(10, 0, 1, 7)], found.addresses);
    }

    #[tokio::test]
    async fn cached_cname_loop_terminates() {
        let cache = SharedCache::new(0);
        cache.add(cname_record("a.gumpe.", "b.gumpe."));
        cache.add(cname_record("b.gumpe.", "a.gumpe."));

        let resolver = no_network_resolver(Some(cache));
        let found = resolver.gethostbyname(&domain("a.gumpe.")).await;

        assert_eq!(CNAME_HOP_LIMIT, found.aliases.len());
        assert!(found.addresses.is_empty());
    }

    #[tokio::test]
    async fn no_candidates_is_a_failure_not_an_error() {
        let resolver = no_network_resolver(None);
        let found = resolver.gethostbyname(&domain("host.gumpe.")).await;

        assert_eq!(HostLookup::empty(domain("host.gumpe.")), found);
    }

    #[test]
    fn glue_addresses_takes_only_additional_a_records() {
        let request = Message::from_question(
            1,
            Question {
                name: domain("host.gumpe."),
                qtype: RecordType::A,
                qclass: RecordClass::IN,
            },
        );
        let mut response = request.make_response();
        response.answers = vec![a_record("host.gumpe.", Ipv4Addr::new(9, 9, 9, 9))];
        response.additional = vec![
            a_record("ns1.gumpe.", Ipv4Addr::new(1, 1, 1, 1)),
            txt_record("ns1.gumpe.", b"not glue"),
            a_record("ns2.gumpe.", Ipv4Addr::new(2, 2, 2, 2)),
        ];

        assert_eq!(
            vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2)],
            glue_addresses(&response)
        );
    }

    #[test]
    fn nameserver_names_takes_only_authority_ns_records() {
        let request = Message::from_question(
            1,
            Question {
                name: domain("host.gumpe."),
                qtype: RecordType::A,
                qclass: RecordClass::IN,
            },
        );
        let mut response = request.make_response();
        response.answers = vec![ns_record("gumpe.", "ns-in-answer.gumpe.")];
        response.authority = vec![
            ns_record("gumpe.", "ns1.gumpe."),
            a_record("ns1.gumpe.", Ipv4Addr::new(1, 1, 1, 1)),
            ns_record("gumpe.", "ns2.gumpe."),
        ];

        assert_eq!(
            vec![domain("ns1.gumpe."), domain("ns2.gumpe.")],
            nameserver_names(&response)
        );
    }

    #[test]
    fn collect_answers_tracks_the_final_name() {
        let mut aliases = Vec::new();
        let mut addresses = Vec::new();

        let canonical = collect_answers(
            domain("www.gumpe."),
            &[
                cname_record("www.gumpe.", "www2.gumpe."),
                cname_record("www2.gumpe.", "server2.gumpe."),
                a_record("server2.gumpe.", Ipv4Addr::new(10, 0, 1, 7)),
            ],
            &mut aliases,
            &mut addresses,
        );

        assert_eq!(domain("server2.gumpe."), canonical);
        assert_eq!(vec![domain("www.gumpe."), domain("www2.gumpe.")], aliases);
        assert_eq!(vec![Ipv4Addr::new(10, 0, 1, 7)], addresses);
    }

    #[test]
    fn response_matches_request_checks_id_qr_and_opcode() {
        let request = Message::from_question(
            1234,
            Question {
                name: domain("host.gumpe."),
                qtype: RecordType::A,
                qclass: RecordClass::IN,
            },
        );
        let response = request.make_response();

        assert!(response_matches_request(&request, &response));

        let mut wrong_id = response.clone();
        wrong_id.header.id = 4321;
        assert!(!response_matches_request(&request, &wrong_id));

        let mut not_a_response = response.clone();
        not_a_response.header.is_response = false;
        assert!(!response_matches_request(&request, &not_a_response));

        let mut wrong_opcode = response;
        wrong_opcode.header.opcode = Opcode::Status;
        assert!(!response_matches_request(&request, &wrong_opcode));
    }
}
