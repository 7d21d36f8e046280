use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

/// Geo attribution for one router IP
#[derive(Debug, Clone, Default)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub asn: Option<String>,
}

struct CacheEntry {
    geo: Option<GeoInfo>,
    cached_at: Instant,
}

/// HTTP geo lookup with a one-hour cache and a courtesy rate limit.
/// The upstream allows roughly 45 requests a minute and may drop
/// excess silently, so missing geo is an empty field, never an error.
pub struct GeoClient {
    http: reqwest::Client,
    cache: Mutex<HashMap<IpAddr, CacheEntry>>,
    last_request: Mutex<Option<Instant>>,
    cache_ttl: Duration,
    min_gap: Duration,
}

impl GeoClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent(concat!("pathwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client");
        Self {
            http,
            cache: Mutex::new(HashMap::new()),
            last_request: Mutex::new(None),
            cache_ttl: Duration::from_secs(3600),
            // ~45 req/min upstream budget, shared with the IP worker
            min_gap: Duration::from_millis(1500),
        }
    }

    /// Lookup geo info for an IP. Returns the cached value when fresh;
    /// skips the network entirely when called faster than the rate
    /// budget allows (the caller retries on a later tick).
    pub async fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(&ip) {
                if entry.cached_at.elapsed() < self.cache_ttl {
                    return entry.geo.clone();
                }
            }
        }

        {
            let mut last = self.last_request.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.min_gap {
                    return None;
                }
            }
            *last = Some(Instant::now());
        }

        let geo = self.fetch(ip).await;
        self.cache
            .lock()
            .insert(ip, CacheEntry { geo: geo.clone(), cached_at: Instant::now() });
        geo
    }

    async fn fetch(&self, ip: IpAddr) -> Option<GeoInfo> {
        let url = format!("http://ip-api.com/json/{ip}?fields=status,country,countryCode,as");
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(err) => {
                debug!(%ip, error = %err, "geo lookup failed");
                return None;
            }
        };
        let body: Value = response.json().await.ok()?;
        if body.get("status").and_then(Value::as_str) != Some("success") {
            return None;
        }
        Some(parse_geo_body(&body))
    }
}

impl Default for GeoClient {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_geo_body(body: &Value) -> GeoInfo {
    GeoInfo {
        country: body.get("country").and_then(Value::as_str).map(str::to_string),
        country_code: body.get("countryCode").and_then(Value::as_str).map(str::to_string),
        asn: body
            .get("as")
            .and_then(Value::as_str)
            .map(|s| s.split_whitespace().next().unwrap_or(s).to_string()),
    }
}
