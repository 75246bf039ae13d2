use super::{BearerToken, FetchSource};
use crate::cursor::Cursor;
use crate::model::{FetchedBatch, RecordKind};
use async_trait::async_trait;
use fleet_sync_core::config::ApiConfig;
use fleet_sync_core::{Error, Result};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use metrics::histogram;
use reqwest::header::{HeaderMap, ACCEPT};
use serde_json::Value;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

// Header names are matched case-insensitively; `HeaderMap` keys are lowercase.
const HAS_MORE_HEADER: &str = "hasmoreitems";
const SINCE_TOKEN_HEADER: &str = "getsincetoken";

/// Client for the vendor's REST API.
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
    organisation_id: String,
    include_sub_trips: bool,
    limiter: DefaultDirectRateLimiter,
}

impl HttpSource {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        config.require_endpoint()?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        let per_minute = NonZeroU32::new(config.requests_per_minute)
            .ok_or_else(|| Error::Config("api.requests_per_minute must be > 0".to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            organisation_id: config.organisation_id.clone(),
            include_sub_trips: config.include_sub_trips,
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
        })
    }

    fn since_url(&self, kind: RecordKind, cursor: &Cursor, quantity: u32) -> String {
        let mut url = format!(
            "{}/api/{}/groups/createdsince/organisation/{}/sincetoken/{}/quantity/{}",
            self.base_url,
            kind.as_str(),
            self.organisation_id,
            cursor,
            quantity
        );
        if kind == RecordKind::Trips && self.include_sub_trips {
            url.push_str("?includeSubTrips=true");
        }
        url
    }

    fn collection_url(&self, kind: RecordKind) -> String {
        format!(
            "{}/api/{}/organisation/{}",
            self.base_url,
            kind.as_str(),
            self.organisation_id
        )
    }

    /// Issues one GET and classifies the outcome.
    async fn get(&self, credential: &BearerToken, url: &str) -> Result<(HeaderMap, Vec<Value>, u64)> {
        self.limiter.until_ready().await;

        let response = self
            .client
            .get(url)
            .bearer_auth(credential.secret())
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        match status.as_u16() {
            200 | 206 => {}
            401 | 403 => {
                return Err(Error::Auth(format!("API rejected credential with {}", status)));
            }
            code => {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::RemoteUnavailable {
                    status: Some(code),
                    details: body.chars().take(200).collect(),
                });
            }
        }

        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(transport_error)?;
        let parsed: Value = serde_json::from_slice(&body)
            .map_err(|e| Error::MalformedResponse(format!("body is not JSON: {}", e)))?;

        Ok((headers, normalize_records(parsed)?, body.len() as u64))
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    let details = if e.is_timeout() {
        format!("request timed out: {}", e)
    } else {
        e.to_string()
    };
    Error::RemoteUnavailable {
        status: e.status().map(|s| s.as_u16()),
        details,
    }
}

/// Accepts a bare array, or an object wrapping the array in `Items` or `Events`.
pub(crate) fn normalize_records(body: Value) -> Result<Vec<Value>> {
    match body {
        Value::Array(records) => Ok(records),
        Value::Object(mut envelope) => {
            for field in ["Items", "Events"] {
                if let Some(Value::Array(records)) = envelope.remove(field) {
                    return Ok(records);
                }
            }
            Err(Error::MalformedResponse(format!(
                "object without an Items/Events list (keys: {})",
                envelope.keys().cloned().collect::<Vec<_>>().join(", ")
            )))
        }
        other => Err(Error::MalformedResponse(format!(
            "expected a list of records, got {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Reads the continuation headers; `HasMoreItems` is the literal string `True` or `False`.
pub(crate) fn continuation(headers: &HeaderMap) -> (bool, Option<Cursor>) {
    let has_more = headers
        .get(HAS_MORE_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "True");

    let next_cursor = headers
        .get(SINCE_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(Cursor::new);

    (has_more, next_cursor)
}

#[async_trait]
impl FetchSource for HttpSource {
    #[instrument(skip(self, credential), fields(kind = %kind, cursor = %cursor))]
    async fn fetch_since(
        &self,
        credential: &BearerToken,
        kind: RecordKind,
        cursor: &Cursor,
        quantity: u32,
    ) -> Result<FetchedBatch> {
        let started = Instant::now();
        let url = self.since_url(kind, cursor, quantity);
        let (headers, records, bytes) = self.get(credential, &url).await?;
        let (has_more, next_cursor) = continuation(&headers);

        histogram!("fleet_sync_fetch_duration_ms", "kind" => kind.as_str())
            .record(started.elapsed().as_millis() as f64);

        debug!(
            records = records.len(),
            has_more,
            next_cursor = ?next_cursor.as_ref().map(Cursor::as_str),
            bytes,
            "Fetched page"
        );

        Ok(FetchedBatch {
            records,
            has_more,
            next_cursor,
            bytes_downloaded: Some(bytes),
        })
    }

    #[instrument(skip(self, credential), fields(kind = %kind))]
    async fn fetch_all(&self, credential: &BearerToken, kind: RecordKind) -> Result<Vec<Value>> {
        let url = self.collection_url(kind);
        let (_, records, bytes) = self.get(credential, &url).await?;
        debug!(records = records.len(), bytes, "Fetched collection");
        Ok(records)
    }

    fn source_id(&self) -> &str {
        "vendor_api"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn source(base_url: String) -> HttpSource {
        HttpSource::new(&ApiConfig {
            base_url,
            organisation_id: "4242".into(),
            quantity: 1000,
            request_timeout_secs: 1,
            requests_per_minute: 600,
            include_sub_trips: false,
        })
        .unwrap()
    }

    fn token() -> BearerToken {
        BearerToken::new("tok")
    }

    const TRIPS_PATH: &str =
        "/api/trips/groups/createdsince/organisation/4242/sincetoken/20240101000000000/quantity/1000";

    #[tokio::test]
    async fn returns_records_and_continuation() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(TRIPS_PATH)
                    .header("Authorization", "Bearer tok");
                then.status(206)
                    .header("GetSinceToken", "20240101010000000")
                    .header("HasMoreItems", "True")
                    .json_body(json!([{"TripId": 1}, {"TripId": 2}]));
            })
            .await;

        let batch = source(server.base_url())
            .fetch_since(&token(), RecordKind::Trips, &Cursor::new("20240101000000000"), 1000)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(batch.records.len(), 2);
        assert!(batch.has_more);
        assert_eq!(batch.next_cursor, Some(Cursor::new("20240101010000000")));
        assert!(batch.bytes_downloaded.unwrap() > 0);
    }

    #[tokio::test]
    async fn envelope_is_normalized_like_a_bare_list() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(
                    "/api/events/groups/createdsince/organisation/4242/sincetoken/20240101000000000/quantity/500",
                );
                then.status(200)
                    .header("HasMoreItems", "False")
                    .json_body(json!({"Events": [{"EventId": 9}]}));
            })
            .await;

        let batch = source(server.base_url())
            .fetch_since(&token(), RecordKind::Events, &Cursor::new("20240101000000000"), 500)
            .await
            .unwrap();

        assert_eq!(batch.records, vec![json!({"EventId": 9})]);
        assert!(!batch.has_more);
        assert_eq!(batch.next_cursor, None);
    }

    #[tokio::test]
    async fn unauthorized_is_auth_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(TRIPS_PATH);
                then.status(401);
            })
            .await;

        let err = source(server.base_url())
            .fetch_since(&token(), RecordKind::Trips, &Cursor::new("20240101000000000"), 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)), "{err}");
    }

    #[tokio::test]
    async fn server_errors_carry_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(TRIPS_PATH);
                then.status(503).body("maintenance");
            })
            .await;

        let err = source(server.base_url())
            .fetch_since(&token(), RecordKind::Trips, &Cursor::new("20240101000000000"), 1000)
            .await
            .unwrap_err();
        match err {
            Error::RemoteUnavailable { status, details } => {
                assert_eq!(status, Some(503));
                assert_eq!(details, "maintenance");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn non_json_body_is_malformed() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(TRIPS_PATH);
                then.status(200).body("<html>oops</html>");
            })
            .await;

        let err = source(server.base_url())
            .fetch_since(&token(), RecordKind::Trips, &Cursor::new("20240101000000000"), 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)), "{err}");
    }

    #[tokio::test]
    async fn timeout_is_remote_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(TRIPS_PATH);
                then.status(200)
                    .delay(Duration::from_millis(2500))
                    .json_body(json!([]));
            })
            .await;

        let err = source(server.base_url())
            .fetch_since(&token(), RecordKind::Trips, &Cursor::new("20240101000000000"), 1000)
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::RemoteUnavailable { status: None, .. }),
            "{err}"
        );
    }

    #[tokio::test]
    async fn fetches_driver_collection() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/drivers/organisation/4242");
                then.status(200).json_body(json!([{"DriverId": 1}, {"DriverId": 2}]));
            })
            .await;

        let drivers = source(server.base_url())
            .fetch_all(&token(), RecordKind::Drivers)
            .await
            .unwrap();
        assert_eq!(drivers.len(), 2);
    }

    #[test]
    fn sub_trips_flag_only_applies_to_trips() {
        let mut src = source("https://integrate.example.com/".into());
        src.include_sub_trips = true;
        let cursor = Cursor::new("20240101000000000");
        assert_eq!(
            src.since_url(RecordKind::Trips, &cursor, 10),
            "https://integrate.example.com/api/trips/groups/createdsince/organisation/4242/sincetoken/20240101000000000/quantity/10?includeSubTrips=true"
        );
        assert!(!src.since_url(RecordKind::Events, &cursor, 10).contains('?'));
    }

    #[test]
    fn normalizes_response_shapes() {
        assert_eq!(normalize_records(json!([1, 2])).unwrap().len(), 2);
        assert_eq!(normalize_records(json!({"Items": [1]})).unwrap().len(), 1);
        assert_eq!(normalize_records(json!({"Events": []})).unwrap().len(), 0);
        assert!(matches!(
            normalize_records(json!({"Items": "nope"})),
            Err(Error::MalformedResponse(_))
        ));
        assert!(matches!(normalize_records(json!(17)), Err(Error::MalformedResponse(_))));
    }

    #[test]
    fn has_more_is_a_string_literal() {
        let mut headers = HeaderMap::new();
        headers.insert(HAS_MORE_HEADER, "true".parse().unwrap());
        assert_eq!(continuation(&headers), (false, None));

        headers.insert(HAS_MORE_HEADER, "True".parse().unwrap());
        headers.insert(SINCE_TOKEN_HEADER, " ".parse().unwrap());
        assert_eq!(continuation(&headers), (true, None));

        headers.insert(SINCE_TOKEN_HEADER, "20240101010000000".parse().unwrap());
        assert_eq!(
            continuation(&headers),
            (true, Some(Cursor::new("20240101010000000")))
        );
    }
}
