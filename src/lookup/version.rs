use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::alert::{AlertKind, Severity};
use crate::app::EngineContext;
use crate::sched::run_periodic;

const RELEASE_URL: &str = "https://api.github.com/repos/pathwatch/pathwatch/tags";
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Polls the release tag endpoint for a newer version.
pub struct VersionClient {
    http: reqwest::Client,
    url: String,
}

impl VersionClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .user_agent(concat!("pathwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client");
        Self { http, url: RELEASE_URL.to_string() }
    }

    /// Fetch the newest published tag: three attempts with doubling
    /// backoff, starting at half a second.
    pub async fn fetch_latest(&self) -> Option<String> {
        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_fetch().await {
                Some(version) => return Some(version),
                None if attempt < MAX_ATTEMPTS => {
                    debug!(attempt, "version fetch failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                None => {}
            }
        }
        None
    }

    async fn try_fetch(&self) -> Option<String> {
        let response = self.http.get(&self.url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let tags: Value = response.json().await.ok()?;
        newest_tag(tags.as_array()?)
    }
}

impl Default for VersionClient {
    fn default() -> Self {
        Self::new()
    }
}

fn newest_tag(tags: &[Value]) -> Option<String> {
    let mut versions: Vec<(Vec<u64>, String)> = tags
        .iter()
        .filter_map(|t| t.get("name").and_then(Value::as_str))
        .filter_map(|name| {
            let clean = name.trim_start_matches(['v', 'V']).to_string();
            let parsed = parse_version(&clean);
            (!parsed.is_empty()).then_some((parsed, clean))
        })
        .collect();
    versions.sort();
    versions.pop().map(|(_, name)| name)
}

/// Parse a version string into numeric components. Suffixes like
/// `-rc2` or `.1-beta` only contribute their leading digits, so
/// `2.4.0-rc1` compares as 2.4.0.
pub fn parse_version(version: &str) -> Vec<u64> {
    version
        .trim_start_matches(['v', 'V'])
        .split('.')
        .filter_map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        })
        .collect()
}

/// Is `latest` strictly newer than `current`?
pub fn is_newer(current: &str, latest: &str) -> bool {
    let mut a = parse_version(current);
    let mut b = parse_version(latest);
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    b > a
}

/// Long-period poll; "update available" surfaces through the
/// repository only.
pub async fn run_version_worker(ctx: EngineContext) {
    let client = std::sync::Arc::new(VersionClient::new());
    let period = ctx.config.version_check_interval;
    let cancel = ctx.cancel.clone();
    run_periodic("version", period, cancel, move || {
        let ctx = ctx.clone();
        let client = client.clone();
        async move {
            let current = env!("CARGO_PKG_VERSION");
            match client.fetch_latest().await {
                Some(latest) if is_newer(current, &latest) => {
                    info!(current, latest, "update available");
                    ctx.repo.add_alert(
                        AlertKind::UpdateAvailable,
                        Severity::Info,
                        &format!("update available: {current} -> {latest}"),
                    );
                    ctx.repo.set_latest_version(Some(latest), false);
                }
                Some(latest) => ctx.repo.set_latest_version(Some(latest), true),
                None => debug!("version check could not reach the release endpoint"),
            }
            Ok(())
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_plain() {
        assert_eq!(parse_version("2.3.3"), vec![2, 3, 3]);
        assert_eq!(parse_version("v1.0"), vec![1, 0]);
    }

    #[test]
    fn test_parse_version_tolerates_suffixes() {
        assert_eq!(parse_version("2.4.0-rc1"), vec![2, 4, 0]);
        assert_eq!(parse_version("v3.0.1-beta.2"), vec![3, 0, 1]);
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer("2.3.3", "2.3.4"));
        assert!(is_newer("2.3.3", "3.0"));
        assert!(!is_newer("2.3.3", "2.3.3"));
        assert!(!is_newer("2.3.3", "2.3.2"));
        // shorter versions pad with zeros
        assert!(is_newer("2.3", "2.3.1"));
        assert!(!is_newer("2.3.0", "2.3"));
        // rc suffix does not make a release look newer than itself
        assert!(!is_newer("2.4.0", "2.4.0-rc1"));
    }

    #[test]
    fn test_newest_tag_picks_highest() {
        let tags: Vec<Value> = vec![
            serde_json::json!({"name": "v2.3.3"}),
            serde_json::json!({"name": "v2.10.0"}),
            serde_json::json!({"name": "v2.4.0-rc1"}),
            serde_json::json!({"name": "not-a-version"}),
        ];
        assert_eq!(newest_tag(&tags), Some("2.10.0".to_string()));
    }

    #[test]
    fn test_newest_tag_empty() {
        assert_eq!(newest_tag(&[]), None);
        let junk = vec![serde_json::json!({"name": "junk"})];
        assert_eq!(newest_tag(&junk), None);
    }
}
