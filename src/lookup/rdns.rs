use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;

use crate::lookup::dns::default_resolver;

struct CacheEntry {
    hostname: Option<String>,
    cached_at: Instant,
}

/// Reverse DNS with a one-hour cache. Hop rows start out with bare IPs;
/// hostnames arrive asynchronously through this lookup.
pub struct ReverseDns {
    resolver: TokioAsyncResolver,
    cache: Mutex<HashMap<IpAddr, CacheEntry>>,
    cache_ttl: Duration,
}

impl ReverseDns {
    pub fn new() -> Self {
        Self {
            resolver: default_resolver(),
            cache: Mutex::new(HashMap::new()),
            cache_ttl: Duration::from_secs(3600),
        }
    }

    pub async fn lookup(&self, ip: IpAddr) -> Option<String> {
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(&ip) {
                if entry.cached_at.elapsed() < self.cache_ttl {
                    return entry.hostname.clone();
                }
            }
        }

        let hostname = match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Err(_) => None,
        };

        self.cache
            .lock()
            .insert(ip, CacheEntry { hostname: hostname.clone(), cached_at: Instant::now() });
        hostname
    }
}

impl Default for ReverseDns {
    fn default() -> Self {
        Self::new()
    }
}
