//! Connectivity probe.
//!
//! The answer is a hint, not a lock: a remote call can still fail after the
//! probe said "online", and callers handle that.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::storage::RemoteCredentials;

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Raw reachability signal. May take arbitrarily long.
    async fn check(&self) -> bool;
}

/// Ask `probe` with a hard deadline. A probe that does not answer in time
/// counts as offline.
pub async fn is_online(probe: &dyn ConnectivityProbe, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, probe.check()).await {
        Ok(online) => online,
        Err(_) => {
            debug!(timeout_ms = timeout.as_millis() as u64, "connectivity probe timed out");
            false
        }
    }
}

/// Probe that issues a `HEAD` request against the remote health endpoint.
pub struct HttpProbe {
    client: reqwest::Client,
    health_url: String,
    api_key: String,
}

impl HttpProbe {
    pub fn new(creds: &RemoteCredentials, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            health_url: format!("{}/rest/v1/", creds.base_url),
            api_key: creds.api_key.to_string(),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn check(&self) -> bool {
        match self
            .client
            .head(&self.health_url)
            .header("apikey", &self.api_key)
            .send()
            .await
        {
            // Any HTTP answer proves the network path; auth problems surface on
            // the real request.
            Ok(resp) => !resp.status().is_server_error(),
            Err(e) => {
                debug!(error = %e, "connectivity probe failed");
                false
            }
        }
    }
}

/// Probe with an externally controlled answer (platform network callbacks,
/// forced offline mode, tests).
#[derive(Debug)]
pub struct ManualProbe {
    online: AtomicBool,
}

impl ManualProbe {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for ManualProbe {
    async fn check(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
