//! Minimal DynamoDB client for liveness checks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    error::{ErrorContext as _, GenericError},
    generic_error,
};

const TARGET_HEADER: &str = "x-amz-target";
const DATE_HEADER: &str = "x-amz-date";
const LIST_TABLES_TARGET: &str = "DynamoDB_20120810.ListTables";
const CONTENT_TYPE_AMZ_JSON: &str = "application/x-amz-json-1.0";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Access key sent to DynamoDB Local, which accepts any credentials.
const LOCAL_ACCESS_KEY: &str = "local";

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListTablesOutput {
    #[serde(default)]
    table_names: Vec<String>,
}

/// A client for a DynamoDB Local instance.
///
/// DynamoDB Local does not verify request signatures, so requests carry a well-formed but unsigned authorization
/// header.
pub struct LocalClient {
    http: reqwest::Client,
    endpoint: String,
    region: String,
}

impl LocalClient {
    /// Creates a new `LocalClient` for the instance at `endpoint`, using `region` for request scoping.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be built, an error is returned.
    pub fn new<R: Into<String>, E: Into<String>>(region: R, endpoint: E) -> Result<Self, GenericError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .error_context("Failed to build HTTP client.")?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            region: region.into(),
        })
    }

    /// Returns the endpoint URL of the instance.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Lists the names of all tables.
    ///
    /// # Errors
    ///
    /// If the request fails, or the instance answers with an error, an error is returned.
    pub async fn list_tables(&self) -> Result<Vec<String>, GenericError> {
        let response = self
            .http
            .post(&self.endpoint)
            .headers(self.headers(LIST_TABLES_TARGET)?)
            .body(json!({}).to_string())
            .send()
            .await
            .with_error_context(|| format!("Failed to reach DynamoDB at {}.", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(generic_error!(
                "DynamoDB at {} answered ListTables with {}: {}",
                self.endpoint,
                status,
                body
            ));
        }

        let output: ListTablesOutput = response
            .json()
            .await
            .error_context("Failed to decode ListTables response.")?;
        Ok(output.table_names)
    }

    /// Lists the names of all tables, retrying until the instance answers or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// If the instance does not answer successfully before the timeout, the last error is returned.
    pub async fn wait_for_tables(&self, timeout: Duration) -> Result<Vec<String>, GenericError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.list_tables().await {
                Ok(tables) => return Ok(tables),
                Err(e) if Instant::now() < deadline => {
                    debug!(endpoint = %self.endpoint, error = %e, "DynamoDB not ready yet.");
                    tokio::time::sleep(READY_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e.context(format!("DynamoDB at {} did not become ready.", self.endpoint))),
            }
        }
    }

    fn headers(&self, target: &'static str) -> Result<HeaderMap, GenericError> {
        let date = amz_date(Utc::now());
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}/{}/dynamodb/aws4_request, SignedHeaders=content-type;host;x-amz-date;x-amz-target, Signature=0",
            LOCAL_ACCESS_KEY,
            &date[..8],
            self.region
        );

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_AMZ_JSON));
        headers.insert(TARGET_HEADER, HeaderValue::from_static(target));
        headers.insert(
            DATE_HEADER,
            HeaderValue::from_str(&date).error_context("Invalid request date.")?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&authorization).error_context("Invalid region for authorization header.")?,
        );
        Ok(headers)
    }
}

/// Formats `time` as an ISO 8601 basic timestamp, as expected by the `x-amz-date` header.
fn amz_date(time: DateTime<Utc>) -> String {
    time.format("%Y%m%dT%H%M%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amz_date_format() {
        let time = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(amz_date(time), "20231114T221320Z");
    }

    #[test]
    fn headers_carry_region_scope() {
        let client = LocalClient::new("us-east-2", "http://localhost:8000").unwrap();
        let headers = client.headers(LIST_TABLES_TARGET).unwrap();

        assert_eq!(headers[TARGET_HEADER], LIST_TABLES_TARGET);
        assert_eq!(headers[CONTENT_TYPE], CONTENT_TYPE_AMZ_JSON);
        let auth = headers[AUTHORIZATION].to_str().unwrap();
        assert!(auth.contains("/us-east-2/dynamodb/aws4_request"));
    }

    #[test]
    fn list_tables_output_tolerates_missing_names() {
        let output: ListTablesOutput = serde_json::from_str("{}").unwrap();
        assert!(output.table_names.is_empty());

        let output: ListTablesOutput = serde_json::from_str(r#"{"TableNames":["a","b"]}"#).unwrap();
        assert_eq!(output.table_names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn wait_for_tables_gives_up() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = LocalClient::new("us-east-1", format!("http://127.0.0.1:{}", port)).unwrap();
        let err = client.wait_for_tables(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.to_string().contains("did not become ready"));
    }
}
