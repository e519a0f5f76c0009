//! PostgREST-style HTTP backend.
//!
//! Tables live under `{base}/rest/v1/{table}`; filters are sent as
//! `column=eq.value` query parameters.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{Filter, RemoteResult, RemoteTable};
use crate::db::Row;
use crate::entities;
use crate::error::RemoteError;
use crate::storage::RemoteCredentials;

/// Default timeout for table requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RestRemote {
    client: Client,
    creds: RemoteCredentials,
}

impl RestRemote {
    pub fn new(creds: RemoteCredentials) -> RemoteResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, creds })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.creds.base_url)
    }

    fn request(&self, method: Method, table: &str, filter: &Filter) -> RequestBuilder {
        let query: Vec<(String, String)> = filter
            .conditions()
            .iter()
            .map(|(column, value)| (column.clone(), format!("eq.{}", filter_value(value))))
            .collect();
        self.client
            .request(method, self.table_url(table))
            .query(&query)
            .header("apikey", self.creds.api_key.as_str())
            .bearer_auth(self.creds.bearer())
    }

    async fn send(&self, table: &str, req: RequestBuilder) -> RemoteResult<String> {
        let resp = req.send().await.map_err(|e| friendly_error(table, &e))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.is_success() {
            return Ok(body);
        }
        debug!(table, status = status.as_u16(), "remote request rejected");
        Err(status_error(status, &body))
    }
}

fn filter_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Connectivity-class request failures.
fn friendly_error(table: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::transport(format!("request to {table} timed out"));
    }
    if err.is_connect() {
        return RemoteError::transport(format!("cannot reach remote for {table}"));
    }
    RemoteError::transport(format!("network error on {table}: {err}"))
}

/// Map a non-success response onto the error taxonomy, preferring the
/// backend's own message.
fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.get("message")
                .or_else(|| json.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string());
    RemoteError::from_status(status.as_u16(), &message)
}

#[async_trait]
impl RemoteTable for RestRemote {
    async fn select(&self, table: &str, filter: &Filter) -> RemoteResult<Vec<Row>> {
        let req = self
            .request(Method::GET, table, filter)
            .query(&[("select", "*")]);
        let body = self.send(table, req).await?;
        serde_json::from_str::<Vec<Row>>(&body)
            .map_err(|e| RemoteError::rejected(200, format!("invalid JSON from {table}: {e}")))
    }

    async fn insert(&self, table: &str, row: &Row) -> RemoteResult<()> {
        let req = self
            .request(Method::POST, table, &Filter::all())
            .header("Prefer", "return=minimal")
            .json(row);
        self.send(table, req).await.map(|_| ())
    }

    async fn update(&self, table: &str, filter: &Filter, patch: &Row) -> RemoteResult<()> {
        let req = self
            .request(Method::PATCH, table, filter)
            .header("Prefer", "return=minimal")
            .json(patch);
        self.send(table, req).await.map(|_| ())
    }

    async fn delete(&self, table: &str, filter: &Filter) -> RemoteResult<()> {
        if filter.is_empty() {
            return Err(RemoteError::rejected(400, "refusing unfiltered delete"));
        }
        let req = self.request(Method::DELETE, table, filter);
        self.send(table, req).await.map(|_| ())
    }

    async fn upsert(&self, table: &str, row: &Row) -> RemoteResult<()> {
        let on_conflict = entities::id_column(table).unwrap_or("id");
        let req = self
            .request(Method::POST, table, &Filter::all())
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(row);
        self.send(table, req).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_values_render_like_postgrest() {
        assert_eq!(filter_value(&json!("s1")), "s1");
        assert_eq!(filter_value(&json!(3)), "3");
        assert_eq!(filter_value(&json!(true)), "true");
        assert_eq!(filter_value(&Value::Null), "null");
    }

    #[test]
    fn test_status_error_uses_backend_message() {
        let err = status_error(
            StatusCode::UNAUTHORIZED,
            r#"{"message":"JWT expired","code":"PGRST301"}"#,
        );
        assert_eq!(err, RemoteError::unauthorized("JWT expired"));

        let err = status_error(StatusCode::CONFLICT, r#"{"message":"duplicate key"}"#);
        assert_eq!(err, RemoteError::rejected(409, "duplicate key"));

        let err = status_error(StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_error() {
        let remote =
            RestRemote::new(RemoteCredentials::new("http://127.0.0.1:9", "anon")).unwrap();
        let err = remote.select("products", &Filter::all()).await.unwrap_err();
        assert!(err.is_transport());
    }
}
