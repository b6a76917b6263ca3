//! Transport layer between the engine and the collector services.
//!
//! [`Transport`] is the seam the scheduler, the time reconciler and the
//! identity registrar talk through. [`HttpTransport`] is the production
//! implementation: a pooled reqwest client with retry and exponential backoff
//! for batch uploads and single-shot calls for time and registration (their
//! callers already loop on a fixed interval).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, Endpoints};
use crate::error::{DeliveryError, ProtocolError, TransportError};
use crate::identity::Identity;
use crate::model::{parse_timestamp, EncodedBatch, RecordKind};

/// Default base delay for exponential backoff (in milliseconds).
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// A serialized batch ready to upload.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Client-side id, only used to correlate log lines
    pub batch_id: Uuid,
    pub kind: RecordKind,
    pub user_id: i64,
    pub record_count: usize,
    /// JSON array body
    pub body: String,
}

impl Batch {
    pub fn new(kind: RecordKind, user_id: i64, encoded: EncodedBatch) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            kind,
            user_id,
            record_count: encoded.encoded,
            body: encoded.body,
        }
    }
}

/// Successful upload acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub status_code: u16,
    /// Attempts it took, including the successful one
    pub attempts: u32,
}

/// Body of the identity registration call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegistrationRequest {
    pub user_id: i64,
    pub platform: String,
    pub device_id: String,
    pub id_for_advertising: Option<String>,
    pub ab_mode: String,
    pub app_version: String,
    /// True when this install has run before (an app version was persisted)
    pub initialized_before: bool,
}

impl RegistrationRequest {
    pub fn new(identity: &Identity, ab_mode: &str, app_version: &str, initialized_before: bool) -> Self {
        Self {
            user_id: identity.user_id,
            platform: identity.platform.clone(),
            device_id: identity.device_id.clone(),
            id_for_advertising: identity.advertising_id.clone(),
            ab_mode: ab_mode.to_string(),
            app_version: app_version.to_string(),
            initialized_before,
        }
    }
}

/// Registration service answer. A negative `user_id` means "not yet".
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub user_id: i64,

    #[serde(default)]
    pub session_count: i64,

    /// Explicit new-user flag, when the service provides one
    #[serde(default)]
    pub is_user_new: Option<bool>,
}

/// Everything the engine needs from the remote side.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Upload one batch to the endpoint for its record kind.
    async fn send_batch(&self, batch: &Batch) -> Result<DeliveryReport, DeliveryError>;

    /// Fetch the collector's notion of "now".
    async fn network_time(&self) -> Result<DateTime<Utc>, DeliveryError>;

    /// Ask the registration service to resolve or create a user id.
    async fn register_identity(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationResponse, DeliveryError>;

    /// Whether the registration service flags `user_id` as a test account.
    async fn fetch_tester(&self, user_id: i64) -> Result<bool, DeliveryError>;

    /// Country of the device's public address, if the lookup knows it.
    async fn fetch_country(&self) -> Result<Option<String>, DeliveryError>;
}

/// Counters kept by [`HttpTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Batches acknowledged by the collector
    pub batches_sent: u64,

    /// Records contained in acknowledged batches
    pub records_sent: u64,

    /// Batches that failed after all retries
    pub batches_failed: u64,

    /// Retries performed across all batches
    pub retries: u64,
}

#[derive(Default)]
struct AtomicStats {
    batches_sent: AtomicU64,
    records_sent: AtomicU64,
    batches_failed: AtomicU64,
    retries: AtomicU64,
}

/// HTTP transport to the analytics and registration services.
///
/// The client uses connection pooling (via reqwest's internal pool),
/// retries batch uploads with exponential backoff, and respects
/// configured timeouts.
///
/// # Example
///
/// ```no_run
/// use telemetry_spool::config::Config;
/// use telemetry_spool::transport::{HttpTransport, Transport};
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::default();
///     let transport = HttpTransport::new(&config).expect("Failed to create transport");
///
///     match transport.network_time().await {
///         Ok(now) => println!("Server time: {}", now),
///         Err(e) => eprintln!("Failed to fetch time: {}", e),
///     }
/// }
/// ```
pub struct HttpTransport {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    endpoints: Endpoints,

    /// Maximum number of retry attempts per batch
    max_retries: u32,

    /// Request timeout duration
    timeout: Duration,

    stats: AtomicStats,
}

impl HttpTransport {
    /// Create a transport from the loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        Self::with_settings(
            config.endpoints.clone(),
            config.request_timeout,
            config.max_retries,
        )
    }

    /// Create a transport with custom settings.
    ///
    /// This is useful for testing or when you need more control over the client.
    pub fn with_settings(
        endpoints: Endpoints,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoints,
            max_retries,
            timeout,
            stats: AtomicStats::default(),
        })
    }

    /// Issue one request and return the response body of a 2xx answer.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<String>,
    ) -> Result<(u16, String), DeliveryError> {
        let mut request = self.client.request(method, url).timeout(self.timeout);
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            let text = response.text().await?;
            Ok((status.as_u16(), text))
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            Err(ProtocolError::Status {
                code: status.as_u16(),
                message,
            }
            .into())
        }
    }

    /// Calculate the backoff delay for a given retry attempt.
    ///
    /// Uses exponential backoff with jitter:
    /// delay = min(base_delay * 2^attempt + jitter, max_delay)
    fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let base_delay = DEFAULT_BASE_DELAY_MS;

        let exponential_delay = base_delay.saturating_mul(1 << attempt.min(10));

        // Add jitter (up to 25% of the delay)
        let jitter = rand::random::<u64>() % (exponential_delay / 4 + 1);

        let total_delay = exponential_delay
            .saturating_add(jitter)
            .min(MAX_RETRY_DELAY_MS);

        Duration::from_millis(total_delay)
    }

    /// Check if an error is worth another attempt.
    ///
    /// Network failures, timeouts, 5xx and 429 are retried; other 4xx and
    /// malformed responses are not.
    fn is_retryable_error(&self, error: &DeliveryError) -> bool {
        match error {
            DeliveryError::Transport(TransportError::Request(_)) => true,
            DeliveryError::Transport(TransportError::Timeout) => true,
            DeliveryError::Transport(TransportError::Config(_)) => false,
            DeliveryError::Protocol(ProtocolError::Status { code, .. }) => {
                *code >= 500 || *code == 429
            }
            DeliveryError::Protocol(ProtocolError::Malformed(_)) => false,
            DeliveryError::RetriesExhausted { .. } => false,
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Get the maximum number of retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Snapshot of the upload counters.
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            batches_sent: self.stats.batches_sent.load(Ordering::Relaxed),
            records_sent: self.stats.records_sent.load(Ordering::Relaxed),
            batches_failed: self.stats.batches_failed.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    /// Upload a batch, retrying transient failures up to `max_retries` times.
    async fn send_batch(&self, batch: &Batch) -> Result<DeliveryReport, DeliveryError> {
        let url = self.endpoints.for_kind(batch.kind);

        debug!(
            kind = %batch.kind,
            records = batch.record_count,
            batch_id = %batch.batch_id,
            url = %url,
            "Sending batch"
        );

        let mut last_error: Option<DeliveryError> = None;
        let mut attempt = 0;

        while attempt <= self.max_retries {
            if attempt > 0 {
                let delay = self.calculate_backoff_delay(attempt);
                warn!(
                    attempt = attempt,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after failure"
                );
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(delay).await;
            }

            match self.execute(Method::POST, url, Some(batch.body.clone())).await {
                Ok((status_code, _)) => {
                    self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .records_sent
                        .fetch_add(batch.record_count as u64, Ordering::Relaxed);
                    info!(
                        kind = %batch.kind,
                        records = batch.record_count,
                        status = status_code,
                        "Successfully sent batch"
                    );
                    return Ok(DeliveryReport {
                        status_code,
                        attempts: attempt + 1,
                    });
                }
                Err(e) => {
                    let is_retryable = self.is_retryable_error(&e);

                    if is_retryable && attempt < self.max_retries {
                        warn!(
                            error = %e,
                            attempt = attempt + 1,
                            max_retries = self.max_retries,
                            "Request failed, will retry"
                        );
                        last_error = Some(e);
                        attempt += 1;
                    } else {
                        self.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
                        error!(
                            error = %e,
                            kind = %batch.kind,
                            attempts = attempt + 1,
                            retryable = is_retryable,
                            "Request failed permanently"
                        );
                        return Err(e);
                    }
                }
            }
        }

        self.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
        let last_error_msg = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string());

        Err(DeliveryError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last_error: last_error_msg,
        })
    }

    async fn network_time(&self) -> Result<DateTime<Utc>, DeliveryError> {
        let (_, body) = self
            .execute(Method::GET, &self.endpoints.network_time, None)
            .await?;

        parse_timestamp(&body).ok_or_else(|| {
            ProtocolError::Malformed(format!("unparseable network time '{}'", body.trim())).into()
        })
    }

    async fn register_identity(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationResponse, DeliveryError> {
        let body = serde_json::to_string(request)
            .map_err(|e| TransportError::Request(format!("could not encode request: {}", e)))?;

        let (_, text) = self
            .execute(Method::PUT, &self.endpoints.registration, Some(body))
            .await?;

        serde_json::from_str(&text).map_err(|e| ProtocolError::Malformed(e.to_string()).into())
    }

    async fn fetch_tester(&self, user_id: i64) -> Result<bool, DeliveryError> {
        let url = format!("{}/{}", self.endpoints.tester, user_id);
        let (_, body) = self.execute(Method::GET, &url, None).await?;

        let flag = body.trim().trim_matches('"');
        if flag.eq_ignore_ascii_case("true") {
            Ok(true)
        } else if flag.eq_ignore_ascii_case("false") {
            Ok(false)
        } else {
            Err(ProtocolError::Malformed(format!("unexpected tester flag '{}'", flag)).into())
        }
    }

    async fn fetch_country(&self) -> Result<Option<String>, DeliveryError> {
        let (_, body) = self
            .execute(Method::GET, &self.endpoints.country, None)
            .await?;

        let json: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(json
            .get("country")
            .and_then(serde_json::Value::as_str)
            .filter(|country| !country.is_empty())
            .map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{encode_batch, Event, WireContext};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Serve one canned response per incoming connection, returning the raw requests.
    async fn serve(
        responses: Vec<(u16, &'static str)>,
    ) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut socket).await);
                let reply = format!(
                    "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
            requests
        });

        (format!("http://{}", addr), handle)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn transport(base: &str, max_retries: u32) -> HttpTransport {
        HttpTransport::with_settings(
            Endpoints::from_bases(base, base),
            Duration::from_secs(5),
            max_retries,
        )
        .unwrap()
    }

    fn event_batch(count: usize) -> Batch {
        let events: Vec<Event> = (0..count)
            .map(|i| {
                let mut event = Event::default();
                event.set_name(&format!("event-{}", i));
                event
            })
            .collect();
        let ctx = WireContext {
            user_id: 42,
            app_version: "1.0.0",
        };
        Batch::new(RecordKind::Event, 42, encode_batch(events.iter(), &ctx))
    }

    #[test]
    fn test_transport_creation() {
        let config = Config::default();
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(
            transport.endpoints().events,
            "http://localhost:8000/AnalyticsData/SendEvents"
        );
        assert_eq!(transport.max_retries(), 3);
        assert_eq!(transport.timeout(), Duration::from_secs(30));
        assert_eq!(transport.stats(), TransportStats::default());
    }

    #[test]
    fn test_backoff_delay_increases() {
        let transport = HttpTransport::new(&Config::default()).unwrap();

        let delay1 = transport.calculate_backoff_delay(0);
        let delay2 = transport.calculate_backoff_delay(1);
        let delay3 = transport.calculate_backoff_delay(2);

        // Jitter only ever adds up to 25%
        assert!(delay1.as_millis() >= 500 && delay1.as_millis() <= 625);
        assert!(delay2.as_millis() >= 1000 && delay2.as_millis() <= 1250);
        assert!(delay3.as_millis() >= 2000 && delay3.as_millis() <= 2500);
    }

    #[test]
    fn test_backoff_delay_caps_at_max() {
        let transport = HttpTransport::new(&Config::default()).unwrap();
        let delay = transport.calculate_backoff_delay(20);
        assert!(delay.as_millis() <= MAX_RETRY_DELAY_MS as u128);
    }

    #[test]
    fn test_retryable_classification() {
        let transport = HttpTransport::new(&Config::default()).unwrap();
        let status = |code| DeliveryError::from(ProtocolError::Status {
            code,
            message: String::new(),
        });

        assert!(transport.is_retryable_error(&status(500)));
        assert!(transport.is_retryable_error(&status(503)));
        assert!(transport.is_retryable_error(&status(429)));
        assert!(!transport.is_retryable_error(&status(400)));
        assert!(!transport.is_retryable_error(&status(404)));
        assert!(transport.is_retryable_error(&TransportError::Timeout.into()));
        assert!(transport
            .is_retryable_error(&TransportError::Request("refused".to_string()).into()));
        assert!(!transport
            .is_retryable_error(&ProtocolError::Malformed("eof".to_string()).into()));
    }

    #[test]
    fn test_registration_request_wire_shape() {
        let identity = Identity {
            user_id: -1,
            platform: "linux".to_string(),
            device_id: "dev-1".to_string(),
            advertising_id: None,
        };
        let request = RegistrationRequest::new(&identity, "B", "2.0.1", true);
        let json: serde_json::Value = serde_json::to_value(&request).unwrap();

        assert_eq!(json["UserId"], -1);
        assert_eq!(json["Platform"], "linux");
        assert_eq!(json["DeviceId"], "dev-1");
        assert!(json["IdForAdvertising"].is_null());
        assert_eq!(json["AbMode"], "B");
        assert_eq!(json["AppVersion"], "2.0.1");
        assert_eq!(json["InitializedBefore"], true);
    }

    #[test]
    fn test_registration_response_parsing() {
        let response: RegistrationResponse =
            serde_json::from_str(r#"{"userId":42,"sessionCount":3}"#).unwrap();
        assert_eq!(response.user_id, 42);
        assert_eq!(response.session_count, 3);
        assert_eq!(response.is_user_new, None);

        let pending: RegistrationResponse = serde_json::from_str(r#"{"userId":-1}"#).unwrap();
        assert_eq!(pending.user_id, -1);
        assert_eq!(pending.session_count, 0);
    }

    #[tokio::test]
    async fn test_send_batch_posts_body_to_kind_endpoint() {
        let (base, server) = serve(vec![(200, "")]).await;
        let transport = transport(&base, 0);
        let batch = event_batch(2);

        let report = transport.send_batch(&batch).await.unwrap();
        assert_eq!(report.status_code, 200);
        assert_eq!(report.attempts, 1);

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("POST /AnalyticsData/SendEvents"));
        assert!(requests[0].contains("\"name\":\"event-0\""));
        assert!(requests[0].contains("\"user_id\":42"));

        let stats = transport.stats();
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.records_sent, 2);
    }

    #[tokio::test]
    async fn test_send_batch_retries_server_errors() {
        let (base, server) = serve(vec![(503, "busy"), (200, "")]).await;
        let transport = transport(&base, 2);

        let report = transport.send_batch(&event_batch(1)).await.unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(server.await.unwrap().len(), 2);
        assert_eq!(transport.stats().retries, 1);
    }

    #[tokio::test]
    async fn test_send_batch_does_not_retry_client_errors() {
        let (base, server) = serve(vec![(400, "bad payload")]).await;
        let transport = transport(&base, 3);

        let err = transport.send_batch(&event_batch(1)).await.unwrap_err();
        match err {
            DeliveryError::Protocol(ProtocolError::Status { code, message }) => {
                assert_eq!(code, 400);
                assert_eq!(message, "bad payload");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(server.await.unwrap().len(), 1);
        assert_eq!(transport.stats().batches_failed, 1);
    }

    #[tokio::test]
    async fn test_network_time_parses_quoted_timestamp() {
        let (base, server) = serve(vec![(200, "\"2024-05-01T10:20:30.123\"")]).await;
        let transport = transport(&base, 0);

        let now = transport.network_time().await.unwrap();
        assert_eq!(now, parse_timestamp("2024-05-01T10:20:30.123").unwrap());

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("GET /Registration/GetNetworkTime"));
    }

    #[tokio::test]
    async fn test_network_time_rejects_garbage() {
        let (base, _server) = serve(vec![(200, "\"yesterday\"")]).await;
        let transport = transport(&base, 0);

        let err = transport.network_time().await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Protocol(ProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_register_identity_uses_put() {
        let (base, server) = serve(vec![(200, r#"{"userId":7,"sessionCount":1}"#)]).await;
        let transport = transport(&base, 0);
        let identity = Identity::new("linux", "dev-9", Some("ad-1".to_string()));
        let request = RegistrationRequest::new(&identity, "A", "1.0.0", false);

        let response = transport.register_identity(&request).await.unwrap();
        assert_eq!(response.user_id, 7);
        assert_eq!(response.session_count, 1);

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("PUT /Registration/GetOrCreateUserId"));
        assert!(requests[0].contains("\"DeviceId\":\"dev-9\""));
        assert!(requests[0].contains("\"IdForAdvertising\":\"ad-1\""));
    }

    #[tokio::test]
    async fn test_fetch_tester_reads_flag_for_user() {
        let (base, server) = serve(vec![(200, "true"), (200, "\"False\""), (200, "maybe")]).await;
        let transport = transport(&base, 0);

        assert!(transport.fetch_tester(42).await.unwrap());
        assert!(!transport.fetch_tester(42).await.unwrap());
        assert!(matches!(
            transport.fetch_tester(42).await.unwrap_err(),
            DeliveryError::Protocol(ProtocolError::Malformed(_))
        ));

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("GET /Registration/GetTester/42 "));
    }

    #[tokio::test]
    async fn test_fetch_country_from_lookup() {
        let (base, server) = serve(vec![
            (200, r#"{"status":"success","country":"Germany"}"#),
            (200, r#"{"status":"fail"}"#),
        ])
        .await;
        let mut endpoints = Endpoints::from_bases(&base, &base);
        endpoints.country = format!("{}/json/", base);
        let transport =
            HttpTransport::with_settings(endpoints, Duration::from_secs(5), 0).unwrap();

        assert_eq!(
            transport.fetch_country().await.unwrap().as_deref(),
            Some("Germany")
        );
        assert_eq!(transport.fetch_country().await.unwrap(), None);

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("GET /json/"));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = transport(&format!("http://{}", addr), 0);
        let err = transport.network_time().await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transport(_)));
    }
}
