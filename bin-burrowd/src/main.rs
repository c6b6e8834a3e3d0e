use bytes::BytesMut;
use clap::Parser;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

use burrow_resolver::cache::SharedCache;
use burrow_resolver::recursive::Resolver;
use burrow_resolver::util::net::{send_udp_bytes_to, DNS_PORT};
use burrow_types::protocol::types::*;
use burrow_types::zones::types::{Catalog, Zone};

/// The cache is persisted here, in the working directory.
const CACHE_FILE: &str = "cache";

/// Incoming datagrams are read into a buffer this large.
const RECV_BUFFER_SIZE: usize = 1024;

/// Everything a request handler needs.  Cloning is cheap: the
/// catalog is behind an `Arc` and the cache is internally shared.
#[derive(Debug, Clone)]
struct ServerContext {
    catalog: Arc<Catalog>,
    cache: Option<SharedCache>,
    resolver: Resolver,
}

/// Decode a datagram and answer it.  Undecodable datagrams get a
/// FormatError response addressed with the query ID when one could
/// be read, and ID 0 otherwise.
async fn handle_raw_message(context: ServerContext, buf: &[u8]) -> Message {
    match Message::from_octets(buf) {
        Ok(query) => resolve_and_build_response(context, query).await,
        Err(error) => {
            tracing::debug!(?error, "could not decode query");
            Message::make_format_error_response(error.id().unwrap_or(0))
        }
    }
}

/// Answer a decoded query, from the zone catalog, the cache, or (for
/// RD queries) the recursive resolver.
///
/// This corresponds to the standard nameserver algorithm of RFC 1034
/// section 4.3.2, minus the parts which need record types this
/// server does not interpret.
async fn resolve_and_build_response(context: ServerContext, query: Message) -> Message {
    let mut response = query.make_response();

    let Some(question) = query.questions.first() else {
        // a query with no question is as good as undecodable
        response.header.rcode = Rcode::FormatError;
        return response;
    };
    let qname = &question.name;

    match context.catalog.lookup(qname) {
        (true, Some(records)) => {
            response.header.is_authoritative = true;
            response.answers = records;
        }
        (true, None) => {
            response.header.is_authoritative = true;
            response.header.rcode = Rcode::NameError;
        }
        (false, _) => {
            let cached = context
                .cache
                .as_ref()
                .and_then(|cache| cache.lookup(qname, RecordType::A, RecordClass::IN));

            if let Some(record) = cached {
                response.answers.push(record);
            } else if query.header.recursion_desired {
                response.answers = context.resolver.lookup(qname).await;
            }
            // without RD the empty answer section stands
        }
    }

    tracing::info!(
        %qname,
        authoritative = %response.header.is_authoritative,
        rcode = ?response.header.rcode,
        answers = %response.answers.len(),
        "answered query"
    );

    response
}

/// The accept loop: read datagrams, spawn a handler task per
/// datagram, stop on ctrl-c.  Responses go out through the shared
/// socket, which is safe to `send_to` concurrently.
async fn listen_udp(context: ServerContext, socket: UdpSocket) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((size, peer)) => {
                    let bytes = BytesMut::from(&buf[..size]);
                    let context = context.clone();
                    let socket = Arc::clone(&socket);
                    tokio::spawn(async move {
                        let response = handle_raw_message(context, bytes.as_ref()).await;
                        match response.into_octets() {
                            Ok(mut serialised) => {
                                if let Err(error) =
                                    send_udp_bytes_to(&socket, peer, &mut serialised).await
                                {
                                    tracing::debug!(?peer, ?error, "UDP send error");
                                }
                            }
                            Err(error) => {
                                tracing::warn!(?error, "could not serialise response");
                            }
                        }
                    });
                }
                Err(error) => {
                    tracing::debug!(?error, "UDP recv error");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }
}

fn begin_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Clone, Parser)]
/// An authoritative and recursive DNS server.
///
/// burrowd answers queries for its own zones authoritatively, and
/// resolves everything else by walking the referral graph from the
/// root nameservers - when the client asks for recursion.  Answers
/// found along the way can be cached, and the cache survives
/// restarts via a JSON file in the working directory.
///
/// UDP only: responses over 512 octets are truncated with the TC
/// flag set.
struct Args {
    /// Port to listen on
    #[clap(short, long, value_parser, default_value_t = DNS_PORT)]
    port: u16,

    /// Enable caching of recursive lookups
    #[clap(short, long, action(clap::ArgAction::SetTrue))]
    caching: bool,

    /// TTL of cached entries, overriding the records' own TTLs (if > 0)
    #[clap(short, long, value_parser, default_value_t = 0)]
    ttl: u32,

    /// UDP timeout, in seconds, for queries to upstream nameservers
    #[clap(long, value_parser, default_value_t = 5)]
    timeout: u64,

    /// Path to the master zone file
    #[clap(long, value_parser, default_value_os_t = PathBuf::from("zone"))]
    zone_file: PathBuf,

    /// Apex the zone file is registered under
    #[clap(long, value_parser, default_value = "gumpe.")]
    zone_origin: DomainName,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging();

    let data = match std::fs::read_to_string(&args.zone_file) {
        Ok(data) => data,
        Err(error) => {
            tracing::error!(path = ?args.zone_file, ?error, "could not read zone file");
            process::exit(1);
        }
    };
    let zone = match Zone::from_master_data(args.zone_origin.clone(), &data) {
        Ok(zone) => zone,
        Err(error) => {
            tracing::error!(path = ?args.zone_file, %error, "could not parse zone file");
            process::exit(1);
        }
    };
    tracing::info!(apex = %zone.apex(), records = %zone.record_count(), "loaded zone");

    let mut catalog = Catalog::new();
    catalog.insert(zone);

    let cache = if args.caching {
        let cache = SharedCache::new(args.ttl);
        match cache.load(Path::new(CACHE_FILE)) {
            Ok(restored) => tracing::info!(%restored, "read cache file"),
            Err(error) => tracing::warn!(%error, "could not read cache file, starting empty"),
        }
        Some(cache)
    } else {
        None
    };

    let context = ServerContext {
        catalog: Arc::new(catalog),
        cache: cache.clone(),
        resolver: Resolver::new(Duration::from_secs(args.timeout), cache.clone()),
    };

    let socket = match UdpSocket::bind((Ipv4Addr::LOCALHOST, args.port)).await {
        Ok(socket) => socket,
        Err(error) => {
            tracing::error!(port = %args.port, ?error, "could not bind UDP socket");
            process::exit(1);
        }
    };
    tracing::info!(port = %args.port, "listening");

    listen_udp(context, socket).await;

    if let Some(cache) = &cache {
        match cache.save(Path::new(CACHE_FILE)) {
            Ok(written) => tracing::info!(%written, "wrote cache file"),
            Err(error) => tracing::warn!(%error, "could not write cache file"),
        }
    }
}
