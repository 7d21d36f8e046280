use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::alert::{AlertKind, Severity};
use crate::app::EngineContext;
use crate::sched::worker_interval;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Public IP observation from one provider
#[derive(Debug, Clone)]
pub struct PublicIpInfo {
    pub ip: IpAddr,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub provider: String,
}

struct Provider {
    url: &'static str,
    /// JSON field holding the IP; None means a plain-text body
    json_ip: Option<&'static str>,
    json_country: Option<&'static str>,
    json_country_code: Option<&'static str>,
}

/// Providers ordered by preference: the JSON one carries geo data, the
/// plain-text ones are fallbacks that tolerate the polling rate.
const PROVIDERS: &[Provider] = &[
    Provider {
        url: "http://ip-api.com/json/",
        json_ip: Some("query"),
        json_country: Some("country"),
        json_country_code: Some("countryCode"),
    },
    Provider { url: "https://ifconfig.me/ip", json_ip: None, json_country: None, json_country_code: None },
    Provider { url: "https://icanhazip.com/", json_ip: None, json_country: None, json_country_code: None },
    Provider { url: "https://ipecho.net/plain", json_ip: None, json_country: None, json_country_code: None },
];

/// Rotates through IP providers; a malformed response from one provider
/// is a transient failure and the next provider is tried, never an
/// IP-change signal.
pub struct PublicIpClient {
    http: reqwest::Client,
}

impl PublicIpClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("pathwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client");
        Self { http }
    }

    pub async fn fetch(&self) -> Option<PublicIpInfo> {
        for provider in PROVIDERS {
            match self.try_provider(provider).await {
                Some(info) => return Some(info),
                None => {
                    debug!(provider = provider.url, "ip provider failed, trying next");
                    continue;
                }
            }
        }
        None
    }

    async fn try_provider(&self, provider: &Provider) -> Option<PublicIpInfo> {
        let response = self.http.get(provider.url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        match provider.json_ip {
            Some(field) => {
                let body: Value = response.json().await.ok()?;
                let ip = validate_public_ip(body.get(field)?.as_str()?)?;
                let country = provider
                    .json_country
                    .and_then(|f| body.get(f))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let country_code = provider
                    .json_country_code
                    .and_then(|f| body.get(f))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Some(PublicIpInfo { ip, country, country_code, provider: provider.url.to_string() })
            }
            None => {
                let body = response.text().await.ok()?;
                let ip = validate_public_ip(&body)?;
                Some(PublicIpInfo {
                    ip,
                    country: None,
                    country_code: None,
                    provider: provider.url.to_string(),
                })
            }
        }
    }
}

impl Default for PublicIpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept only strings that parse as a routable public address.
pub fn validate_public_ip(raw: &str) -> Option<IpAddr> {
    let ip: IpAddr = raw.trim().parse().ok()?;
    let routable = match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            let unique_local = (seg[0] & 0xfe00) == 0xfc00;
            let link_local = (seg[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    };
    routable.then_some(ip)
}

/// Poll the public IP, record it, and on a confirmed change raise an
/// info alert and ask the hop prober to rebuild its table.
pub async fn run_ip_worker(ctx: EngineContext) {
    let client = PublicIpClient::new();
    let mut ticker = worker_interval(ctx.config.ip_check_interval);
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(info) = client.fetch().await else {
                    debug!("all ip providers failed this tick");
                    continue;
                };
                let change = ctx.repo.update_public_ip(
                    info.ip,
                    info.country,
                    info.country_code,
                    info.provider,
                );
                if let Some((old, new)) = change {
                    info!(%old, %new, "public IP changed");
                    ctx.repo.add_alert(
                        AlertKind::IpChange,
                        Severity::Info,
                        &format!("public IP changed: {old} -> {new}"),
                    );
                    if ctx.config.enable_sound_alerts {
                        ctx.repo.trigger_alert_sound(AlertKind::IpChange);
                    }
                    if ctx.config.enable_hop_monitoring {
                        ctx.hop_rediscover.store(true, Ordering::SeqCst);
                    }
                    // a new address usually means a new path; ask for a
                    // fresh discovery as soon as the cooldown allows
                    ctx.traceroute_request.store(true, Ordering::SeqCst);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_public() {
        assert!(validate_public_ip("8.8.8.8").is_some());
        assert!(validate_public_ip(" 1.1.1.1\n").is_some());
        assert!(validate_public_ip("2606:4700:4700::1111").is_some());
    }

    #[test]
    fn test_validate_rejects_non_routable() {
        assert!(validate_public_ip("192.168.1.10").is_none());
        assert!(validate_public_ip("10.0.0.1").is_none());
        assert!(validate_public_ip("127.0.0.1").is_none());
        assert!(validate_public_ip("169.254.1.1").is_none());
        assert!(validate_public_ip("0.0.0.0").is_none());
        assert!(validate_public_ip("::1").is_none());
        assert!(validate_public_ip("fe80::1").is_none());
        assert!(validate_public_ip("fd00::1").is_none());
    }

    #[test]
    fn test_validate_rejects_garbage() {
        assert!(validate_public_ip("").is_none());
        assert!(validate_public_ip("<html>rate limited</html>").is_none());
        assert!(validate_public_ip("999.1.1.1").is_none());
        assert!(validate_public_ip("8.8.8.8; rm -rf /").is_none());
    }
}
