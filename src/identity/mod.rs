//! Identities: one saved login + proxy + fingerprint profile each.
//!
//! Profiles come from a JSON file, saved session cookies from per-user JSON
//! files in a cookie directory, and proxy-only identities (used for the
//! enrichment catalogs) from a proxies JSON file.

pub mod check;

use std::fmt;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::IdentityError;

pub use check::CredentialChecker;

// ── Types ───────────────────────────────────────────────────────────

/// Upstream proxy for one identity's browser sessions.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// `host:port`, optionally with a scheme.
    pub server: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

/// Browser window size used as part of the fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1366,
            height: 768,
        }
    }
}

/// A browser cookie as saved by the login flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: Option<bool>,
    #[serde(default)]
    pub secure: Option<bool>,
}

/// One complete profile driving its own browser session(s).
///
/// Immutable once loaded. Health during a run is tracked separately by
/// the circuit breakers, never on the identity itself.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub proxy: Option<ProxySettings>,
    pub user_agent: Option<String>,
    pub viewport: Viewport,
    pub cookies: Vec<Cookie>,
}

impl Identity {
    /// A bare identity with no proxy or cookies.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            proxy: None,
            user_agent: None,
            viewport: Viewport::default(),
            cookies: Vec::new(),
        }
    }

    /// Same profile without saved cookies (a fresh, anonymous session).
    pub fn without_cookies(&self) -> Self {
        Self {
            cookies: Vec::new(),
            ..self.clone()
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

// ── On-disk formats ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileRecord {
    #[serde(rename = "eBay")]
    account: AccountRecord,
    #[serde(default)]
    proxy: Option<ProfileProxyRecord>,
    #[serde(default)]
    user_agent: Option<String>,
    #[serde(default)]
    viewport: Option<Viewport>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountRecord {
    user_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileProxyRecord {
    host: String,
    port: serde_json::Value,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProxyRecord {
    #[serde(rename = "proxyURL")]
    proxy_url: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl From<ProfileRecord> for Identity {
    fn from(record: ProfileRecord) -> Self {
        let proxy = record.proxy.map(|p| {
            let port = match p.port {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            ProxySettings {
                server: format!("{}:{}", p.host, port),
                username: non_empty(p.user_name),
                password: non_empty(p.password).map(SecretString::from),
            }
        });
        Self {
            id: record.account.user_name,
            proxy,
            user_agent: non_empty(record.user_agent),
            viewport: record.viewport.unwrap_or_default(),
            cookies: Vec::new(),
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, IdentityError> {
    let raw = std::fs::read_to_string(path).map_err(|source| IdentityError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| IdentityError::Parse {
        path: path.display().to_string(),
        source,
    })
}

// ── Loading ─────────────────────────────────────────────────────────

/// Locations of the identity source files.
#[derive(Debug, Clone)]
pub struct IdentitySources {
    pub users_file: PathBuf,
    pub cookie_dir: PathBuf,
    pub proxies_file: PathBuf,
}

impl IdentitySources {
    /// Load every profile and attach its saved cookies, if any.
    ///
    /// A profile's cookie file is the first `*.json` in the cookie
    /// directory whose stem holds the username as a whole `.`/`_`/`-`
    /// separated part. A missing cookie directory leaves every identity
    /// without cookies.
    pub fn load_identities(&self) -> Result<Vec<Identity>, IdentityError> {
        let records: Vec<ProfileRecord> = read_json(&self.users_file)?;
        let cookie_files = self.cookie_files();

        let mut identities = Vec::with_capacity(records.len());
        for record in records {
            let mut identity = Identity::from(record);
            match cookie_files
                .iter()
                .find(|f| stem_names_user(f, &identity.id))
            {
                Some(file) => {
                    identity.cookies = read_json(file)?;
                    debug!(
                        identity = %identity.id,
                        cookies = identity.cookies.len(),
                        "Loaded cookies"
                    );
                }
                None => info!(identity = %identity.id, "No cookie file for identity"),
            }
            identities.push(identity);
        }

        info!(count = identities.len(), "Loaded identity profiles");
        Ok(identities)
    }

    /// Load proxy-only identities. A missing file yields none.
    pub fn load_proxy_identities(&self) -> Result<Vec<Identity>, IdentityError> {
        if !self.proxies_file.exists() {
            warn!(path = %self.proxies_file.display(), "Proxies file not found");
            return Ok(Vec::new());
        }
        let records: Vec<ProxyRecord> = read_json(&self.proxies_file)?;
        Ok(records
            .into_iter()
            .enumerate()
            .map(|(i, record)| Identity {
                proxy: Some(ProxySettings {
                    server: record.proxy_url,
                    username: non_empty(record.username),
                    password: non_empty(record.password).map(SecretString::from),
                }),
                ..Identity::new(format!("proxy-{}", i + 1))
            })
            .collect())
    }

    fn cookie_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.cookie_dir) else {
            warn!(dir = %self.cookie_dir.display(), "Cookie directory not readable");
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        files
    }
}

fn stem_names_user(path: &Path, user: &str) -> bool {
    let Some(stem) = path.file_stem().and_then(|n| n.to_str()) else {
        return false;
    };
    if user.is_empty() {
        return false;
    }
    let separator = |c: Option<char>| c.is_none_or(|c| matches!(c, '.' | '_' | '-'));
    stem.match_indices(user).any(|(at, _)| {
        let before = stem[..at].chars().next_back();
        let after = stem[at + user.len()..].chars().next();
        separator(before) && separator(after)
    })
}
