//! Remote endpoint credentials in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API.

use keyring::Entry;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{Result, SyncError};

const SERVICE_NAME: &str = "offline-pos-sync";

pub const KEY_REMOTE_URL: &str = "remote_url";
pub const KEY_REMOTE_API_KEY: &str = "remote_api_key";
pub const KEY_ACCESS_TOKEN: &str = "access_token";

const ALL_KEYS: &[&str] = &[KEY_REMOTE_URL, KEY_REMOTE_API_KEY, KEY_ACCESS_TOKEN];

/// Retrieve a single credential. Returns `None` when the entry does not
/// exist or the platform store is unavailable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential.
pub fn set_credential(key: &str, value: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| SyncError::Config(e.to_string()))?;
    entry
        .set_password(value)
        .map_err(|e| SyncError::Config(e.to_string()))
}

/// Delete a credential. Succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| SyncError::Config(e.to_string()))?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(SyncError::Config(e.to_string())),
    }
}

/// Remove every credential this crate manages (sign-out).
pub fn clear_credentials() -> Result<()> {
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    info!("Remote credentials cleared");
    Ok(())
}

/// Everything needed to talk to the remote table API.
#[derive(Clone)]
pub struct RemoteCredentials {
    pub base_url: String,
    pub api_key: Zeroizing<String>,
    /// Signed-in user's token; the API key is used when absent.
    pub access_token: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for RemoteCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCredentials")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RemoteCredentials {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            api_key: Zeroizing::new(api_key.trim().to_string()),
            access_token: None,
        }
    }

    /// Load from the credential store; `None` when the device is not
    /// configured yet.
    pub fn load() -> Option<Self> {
        let url = get_credential(KEY_REMOTE_URL)?;
        let key = get_credential(KEY_REMOTE_API_KEY)?;
        let mut creds = Self::new(&url, &key);
        creds.access_token = get_credential(KEY_ACCESS_TOKEN).map(Zeroizing::new);
        Some(creds)
    }

    pub fn save(&self) -> Result<()> {
        set_credential(KEY_REMOTE_URL, &self.base_url)?;
        set_credential(KEY_REMOTE_API_KEY, &self.api_key)?;
        match &self.access_token {
            Some(token) => set_credential(KEY_ACCESS_TOKEN, token)?,
            None => delete_credential(KEY_ACCESS_TOKEN)?,
        }
        Ok(())
    }

    /// Token sent as the bearer credential.
    pub fn bearer(&self) -> &str {
        self.access_token
            .as_deref()
            .map(String::as_str)
            .unwrap_or(self.api_key.as_str())
    }
}

/// Normalise the remote URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/rest/v1` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if let Some(stripped) = url.strip_suffix("/rest/v1") {
        url = stripped.to_string();
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("example.com/"), "https://example.com");
        assert_eq!(normalize_base_url("localhost:54321"), "http://localhost:54321");
        assert_eq!(
            normalize_base_url(" https://db.example.com/rest/v1/ "),
            "https://db.example.com"
        );
    }

    #[test]
    fn test_bearer_prefers_access_token() {
        let mut creds = RemoteCredentials::new("example.com", "anon-key");
        assert_eq!(creds.bearer(), "anon-key");
        creds.access_token = Some(Zeroizing::new("user-jwt".into()));
        assert_eq!(creds.bearer(), "user-jwt");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = RemoteCredentials::new("example.com", "anon-key");
        let printed = format!("{creds:?}");
        assert!(!printed.contains("anon-key"));
        assert!(printed.contains("https://example.com"));
    }
}
