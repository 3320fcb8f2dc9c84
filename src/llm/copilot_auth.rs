//! GitHub Copilot authentication: OAuth 2.0 Device Authorization Grant
//! (RFC 8628) plus token persistence in the state folder.

use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::STATE_DIR;

/// OAuth app client id used for the device-code flow.
pub const CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";

const SCOPE: &str = "read:user";
const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Margin added to every polling sleep so we never poll early.
const POLL_JITTER: Duration = Duration::from_millis(500);

/// Token file name inside `<basedir>/.rai/`.
pub const TOKEN_FILE: &str = "copilot-token";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("device code request failed: {0}")]
    DeviceCode(String),

    #[error("authorization failed: {0}")]
    Denied(String),

    #[error("login cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("token file: {0}")]
    Io(#[from] io::Error),
}

// ============================== Domains ==============================

/// Normalize a user-supplied domain: strip scheme, port, trailing slash.
/// Schemeless inputs are treated as `https://` URLs.
pub fn normalize_domain(input: &str) -> String {
    let input = input.trim();
    if input.is_empty() {
        return String::new();
    }

    let without_scheme = match input.split_once("://") {
        Some((_, rest)) => rest,
        None => input,
    };

    let host = without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme);
    let host = host.split(':').next().unwrap_or(host);
    host.trim_end_matches('/').to_string()
}

/// Copilot API base URL for a (possibly enterprise) GitHub domain.
pub fn copilot_base_url(domain: &str) -> String {
    let normalized = normalize_domain(domain);
    if normalized.is_empty() || normalized == "github.com" {
        "https://api.githubcopilot.com".to_string()
    } else {
        format!("https://copilot-api.{normalized}")
    }
}

fn device_code_url(domain: &str) -> String {
    let normalized = normalize_domain(domain);
    if normalized.is_empty() || normalized == "github.com" {
        "https://github.com/login/device/code".to_string()
    } else {
        format!("https://{normalized}/login/device/code")
    }
}

fn access_token_url(domain: &str) -> String {
    let normalized = normalize_domain(domain);
    if normalized.is_empty() || normalized == "github.com" {
        "https://github.com/login/oauth/access_token".to_string()
    } else {
        format!("https://{normalized}/login/oauth/access_token")
    }
}

// ============================== Wire types ==============================

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    #[serde(default)]
    interval: u64,
}

#[derive(Debug, Default, Deserialize)]
struct TokenPollResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
}

/// What to do after one poll response.
#[derive(Debug, PartialEq)]
enum PollStep {
    Granted(String),
    /// Keep polling at this interval.
    Continue(Duration),
    Fail(String),
}

/// Pure polling decision, per RFC 8628 §3.5: `slow_down` uses the
/// server-supplied interval when positive, else the previous interval + 5s.
fn poll_step(current: Duration, response: &TokenPollResponse) -> PollStep {
    if let Some(token) = &response.access_token {
        return PollStep::Granted(token.clone());
    }
    match response.error.as_deref() {
        Some("authorization_pending") => PollStep::Continue(current),
        Some("slow_down") => match response.interval {
            Some(secs) if secs > 0 => PollStep::Continue(Duration::from_secs(secs)),
            _ => PollStep::Continue(current + Duration::from_secs(5)),
        },
        Some(err) => PollStep::Fail(err.to_string()),
        None => PollStep::Fail("empty token response".to_string()),
    }
}

// ============================== Flow ==============================

/// Run the device-code flow against `domain` (empty means github.com).
/// Returns the access token and the domain it belongs to.
pub async fn login(ctx: CancellationToken, domain: &str) -> Result<(String, String), AuthError> {
    let client = reqwest::Client::new();
    let domain = normalize_domain(domain);

    let response = client
        .post(device_code_url(&domain))
        .header("Accept", "application/json")
        .json(&serde_json::json!({"client_id": CLIENT_ID, "scope": SCOPE}))
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(AuthError::DeviceCode(format!("HTTP {status}: {body}")));
    }
    let device: DeviceCodeResponse = response
        .json()
        .await
        .map_err(|e| AuthError::DeviceCode(e.to_string()))?;

    let open_url = device
        .verification_uri_complete
        .as_deref()
        .unwrap_or(&device.verification_uri);
    if webbrowser::open(open_url).is_err() {
        log::debug!("could not open browser for {open_url}");
    }
    println!("Open {} and enter code: {}", device.verification_uri, device.user_code);

    let token_url = access_token_url(&domain);
    let mut interval = Duration::from_secs(device.interval.max(1));

    loop {
        tokio::select! {
            _ = ctx.cancelled() => return Err(AuthError::Cancelled),
            _ = tokio::time::sleep(interval + POLL_JITTER) => {}
        }

        let response = client
            .post(&token_url)
            .header("Accept", "application/json")
            .json(&serde_json::json!({
                "client_id": CLIENT_ID,
                "device_code": &device.device_code,
                "grant_type": GRANT_TYPE,
            }))
            .send()
            .await?;
        let poll: TokenPollResponse = response.json().await.unwrap_or_default();

        match poll_step(interval, &poll) {
            PollStep::Granted(token) => return Ok((token, domain)),
            PollStep::Continue(next) => interval = next,
            PollStep::Fail(err) => return Err(AuthError::Denied(err)),
        }
    }
}

// ============================== Persistence ==============================

pub fn token_path(base_dir: &Path) -> PathBuf {
    base_dir.join(STATE_DIR).join(TOKEN_FILE)
}

/// Persist the token: atomic write (temp file + rename), mode 0600.
pub fn save_token(base_dir: &Path, token: &str) -> Result<(), AuthError> {
    let path = token_path(base_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, format!("{token}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Read the persisted token, if any.
pub fn load_token(base_dir: &Path) -> Option<String> {
    let text = fs::read_to_string(token_path(base_dir)).ok()?;
    let token = text.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain(""), "");
        assert_eq!(normalize_domain("github.com"), "github.com");
        assert_eq!(normalize_domain("https://github.com"), "github.com");
        assert_eq!(normalize_domain("https://ghe.corp.com/"), "ghe.corp.com");
        assert_eq!(normalize_domain("ghe.corp.com:8443"), "ghe.corp.com");
        assert_eq!(
            normalize_domain("http://ghe.corp.com:8443/path/"),
            "ghe.corp.com"
        );
    }

    #[test]
    fn test_base_url_round_trip_law() {
        // Default base iff the domain normalizes to "" or "github.com"
        for domain in ["", "github.com", "https://github.com/", "github.com:443"] {
            assert_eq!(copilot_base_url(domain), "https://api.githubcopilot.com");
            let n = normalize_domain(domain);
            assert!(n.is_empty() || n == "github.com");
        }
        assert_eq!(
            copilot_base_url("ghe.corp.com"),
            "https://copilot-api.ghe.corp.com"
        );
    }

    #[test]
    fn test_endpoint_urls() {
        assert_eq!(
            device_code_url(""),
            "https://github.com/login/device/code"
        );
        assert_eq!(
            access_token_url("github.com"),
            "https://github.com/login/oauth/access_token"
        );
        assert_eq!(
            device_code_url("ghe.corp.com"),
            "https://ghe.corp.com/login/device/code"
        );
        assert_eq!(
            access_token_url("ghe.corp.com"),
            "https://ghe.corp.com/login/oauth/access_token"
        );
    }

    #[test]
    fn test_poll_step_granted() {
        let response = TokenPollResponse {
            access_token: Some("gho_abc".to_string()),
            ..Default::default()
        };
        assert_eq!(
            poll_step(Duration::from_secs(5), &response),
            PollStep::Granted("gho_abc".to_string())
        );
    }

    #[test]
    fn test_poll_step_pending_keeps_interval() {
        let response = TokenPollResponse {
            error: Some("authorization_pending".to_string()),
            ..Default::default()
        };
        assert_eq!(
            poll_step(Duration::from_secs(5), &response),
            PollStep::Continue(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_poll_step_slow_down_server_interval() {
        // Device endpoint said 5; slow_down with interval=7 means the next
        // poll happens no sooner than 7s (+ the 500ms margin).
        let response = TokenPollResponse {
            error: Some("slow_down".to_string()),
            interval: Some(7),
            ..Default::default()
        };
        match poll_step(Duration::from_secs(5), &response) {
            PollStep::Continue(next) => {
                assert_eq!(next, Duration::from_secs(7));
                assert!(next + POLL_JITTER >= Duration::from_millis(7500));
            }
            other => panic!("expected Continue, got {other:?}"),
        }
    }

    #[test]
    fn test_poll_step_slow_down_without_interval_adds_five() {
        let response = TokenPollResponse {
            error: Some("slow_down".to_string()),
            interval: None,
            ..Default::default()
        };
        assert_eq!(
            poll_step(Duration::from_secs(5), &response),
            PollStep::Continue(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_poll_step_other_error_fails() {
        let response = TokenPollResponse {
            error: Some("expired_token".to_string()),
            ..Default::default()
        };
        assert_eq!(
            poll_step(Duration::from_secs(5), &response),
            PollStep::Fail("expired_token".to_string())
        );
    }

    #[test]
    fn test_token_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_token(dir.path()).is_none());

        save_token(dir.path(), "gho_secret").unwrap();
        assert_eq!(load_token(dir.path()).as_deref(), Some("gho_secret"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(token_path(dir.path()))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
