use clap::Parser;
use std::path::Path;
use std::process;
use std::time::Duration;

use burrow_resolver::cache::SharedCache;
use burrow_resolver::recursive::Resolver;
use burrow_types::protocol::types::DomainName;

/// The same cache file the server uses.
const CACHE_FILE: &str = "cache";

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser)]
/// Resolve a host name to IPv4 addresses, the way the server would:
/// iteratively, starting from the root nameservers.
///
/// Exits nonzero when no address could be found.
struct Args {
    /// Host name to resolve
    #[clap(value_parser)]
    host: DomainName,

    /// Enable caching: read and write the cache file in the working
    /// directory
    #[clap(short, long, action(clap::ArgAction::SetTrue))]
    caching: bool,

    /// TTL of cached entries, overriding the records' own TTLs (if > 0)
    #[clap(short, long, value_parser, default_value_t = 0)]
    ttl: u32,

    /// UDP timeout, in seconds, for queries to upstream nameservers
    #[clap(long, value_parser, default_value_t = 5)]
    timeout: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let cache = if args.caching {
        let cache = SharedCache::new(args.ttl);
        if let Err(error) = cache.load(Path::new(CACHE_FILE)) {
            eprintln!("; could not read cache file: {error}");
        }
        Some(cache)
    } else {
        None
    };

    let resolver = Resolver::new(Duration::from_secs(args.timeout), cache.clone());
    let found = resolver.gethostbyname(&args.host).await;

    println!("{}", found.canonical);
    for alias in &found.aliases {
        println!("alias: {alias}");
    }
    for address in &found.addresses {
        println!("address: {address}");
    }

    if let Some(cache) = &cache {
        if let Err(error) = cache.save(Path::new(CACHE_FILE)) {
            eprintln!("; could not write cache file: {error}");
        }
    }

    if found.addresses.is_empty() {
        process::exit(1);
    }
}
