//! Retrying client for the remote data-point API.
//!
//! Two operations: a realtime value lookup and a single-day history query.
//! Connection and timeout failures are retried with linear backoff; a bad
//! status or a malformed payload surfaces immediately.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::dataset::{format_date, ColumnId, TimeWindow};

const REALTIME_PATH: &str = "data_point";
const HISTORY_PATH: &str = "tags/get-history";
const HISTORY_FUNCTION: &str = "getDBHistory";
const MAX_LOGGED_BODY_CHARS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub timeout_ms: u64,
}

impl RetryPolicy {
    pub fn realtime_default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 500,
            timeout_ms: 5_000,
        }
    }

    pub fn history_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 700,
            timeout_ms: 3_000,
        }
    }

    /// Wait between attempt `attempt` and `attempt + 1` (1-based): linear in the attempt number.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub base_url: String,
    pub token: String,
    pub key: String,
    /// Fixed offset used to decode remote epoch-millisecond timestamps.
    pub utc_offset: FixedOffset,
    pub accept_invalid_certs: bool,
    pub realtime: RetryPolicy,
    pub history: RetryPolicy,
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            key: key.into(),
            utc_offset: default_utc_offset(),
            accept_invalid_certs: false,
            realtime: RetryPolicy::realtime_default(),
            history: RetryPolicy::history_default(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("key", &"<redacted>")
            .field("utc_offset", &self.utc_offset)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("realtime", &self.realtime)
            .field("history", &self.history)
            .finish()
    }
}

/// UTC+07:00, the offset the remote system reports in.
pub fn default_utc_offset() -> FixedOffset {
    FixedOffset::east_opt(7 * 3_600).unwrap_or_else(|| Utc.fix())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Connect,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Other,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Timeout | TransportErrorKind::Connect
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// One form-encoded POST. Implementations classify failures, they never retry.
pub trait RemoteTransport: Send + Sync {
    fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<HttpReply, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(accept_invalid_certs: bool) -> Result<Self, RemoteError> {
        let client = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|err| RemoteError::ClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl RemoteTransport for ReqwestTransport {
    fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<HttpReply, TransportError> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .form(form)
            .send()
            .map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(classify_reqwest_error)?;
        Ok(HttpReply { status, body })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::connect(err.to_string())
    } else {
        TransportError::other(err.to_string())
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Shared cancellation flag for a run and everything it spawns.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPoint {
    pub ts: DateTime<FixedOffset>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote unavailable: {url} returned HTTP {status}: {body}")]
    RemoteUnavailable {
        url: String,
        status: u16,
        body: String,
    },
    #[error("malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },
    #[error("retries exhausted after {attempts} attempt(s) for {url}: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last: TransportError,
    },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("point identifier must not be empty")]
    EmptyPointId,
    #[error("remote call cancelled")]
    Cancelled,
    #[error("HTTP client build error: {0}")]
    ClientBuild(String),
}

impl RemoteError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RemoteUnavailable { .. } => "remote_unavailable",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Request { .. } => "request_failed",
            Self::EmptyPointId => "empty_point_id",
            Self::Cancelled => "cancelled",
            Self::ClientBuild(_) => "client_build",
        }
    }
}

enum AttemptError {
    Transient(TransportError),
    Fatal(RemoteError),
}

pub struct RemoteClient {
    config: RemoteConfig,
    transport: Arc<dyn RemoteTransport>,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancelToken,
}

impl RemoteClient {
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let transport = ReqwestTransport::new(config.accept_invalid_certs)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: RemoteConfig, transport: Arc<dyn RemoteTransport>) -> Self {
        Self {
            config,
            transport,
            sleeper: Arc::new(ThreadSleeper),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn fetch_realtime(&self, point_id: &str) -> Result<f64, RemoteError> {
        let point_id = point_id.trim();
        if point_id.is_empty() {
            return Err(RemoteError::EmptyPointId);
        }

        let url = self.config.endpoint(REALTIME_PATH);
        let form = [("token", self.config.token.as_str()), ("point_id", point_id)];
        let label = format!("point {point_id}");

        let value = self.with_retry(&self.config.realtime, &url, &label, || {
            let reply = self.post(&url, &form, &self.config.realtime)?;
            parse_realtime_body(&url, &reply.body).map_err(AttemptError::Fatal)
        })?;

        info!(
            component = "remote_client",
            event = "remote.realtime.ok",
            point_id,
            value
        );
        Ok(value)
    }

    /// One day of history for one column. An empty body is an empty day, not an error.
    pub fn fetch_history(
        &self,
        column: ColumnId,
        date: NaiveDate,
        window: &TimeWindow,
        interval_seconds: u32,
    ) -> Result<Vec<HistoryPoint>, RemoteError> {
        let url = self.config.endpoint(HISTORY_PATH);
        let current_date = format_date(date);
        let packet = json!({
            "function": HISTORY_FUNCTION,
            "key": self.config.key,
            "params": {
                "row_id": column.get(),
                "current_date": current_date,
                "time_start": window.start_text(),
                "time_end": window.end_text(),
                "interval": interval_seconds,
                "quality": 0,
            }
        })
        .to_string();
        let form = [("packet", packet.as_str())];
        let label = format!("column {column} on {current_date}");

        let points = self.with_retry(&self.config.history, &url, &label, || {
            let reply = self.post(&url, &form, &self.config.history)?;
            parse_history_body(&url, &reply.body, self.config.utc_offset)
                .map_err(AttemptError::Fatal)
        })?;

        if points.is_empty() {
            warn!(
                component = "remote_client",
                event = "remote.history.empty",
                column = %column,
                date = %current_date
            );
        } else {
            debug!(
                component = "remote_client",
                event = "remote.history.ok",
                column = %column,
                date = %current_date,
                points = points.len()
            );
        }
        Ok(points)
    }

    fn post(
        &self,
        url: &str,
        form: &[(&str, &str)],
        policy: &RetryPolicy,
    ) -> Result<HttpReply, AttemptError> {
        let reply = self
            .transport
            .post_form(url, form, policy.timeout())
            .map_err(|err| {
                if err.is_transient() {
                    AttemptError::Transient(err)
                } else {
                    AttemptError::Fatal(RemoteError::Request {
                        url: url.to_string(),
                        source: err,
                    })
                }
            })?;

        if !(200..300).contains(&reply.status) {
            return Err(AttemptError::Fatal(RemoteError::RemoteUnavailable {
                url: url.to_string(),
                status: reply.status,
                body: truncate(&reply.body),
            }));
        }
        Ok(reply)
    }

    fn with_retry<T>(
        &self,
        policy: &RetryPolicy,
        url: &str,
        label: &str,
        mut call: impl FnMut() -> Result<T, AttemptError>,
    ) -> Result<T, RemoteError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt: u32 = 1;

        loop {
            if self.cancel.is_cancelled() {
                return Err(RemoteError::Cancelled);
            }
            if attempt > 1 {
                info!(
                    component = "remote_client",
                    event = "remote.retry.attempt",
                    target_label = label,
                    attempt,
                    max_attempts
                );
            }

            match call() {
                Ok(value) => return Ok(value),
                Err(AttemptError::Fatal(err)) => {
                    error!(
                        component = "remote_client",
                        event = "remote.call.failed",
                        target_label = label,
                        error_kind = err.kind(),
                        error = %err
                    );
                    return Err(err);
                }
                Err(AttemptError::Transient(err)) => {
                    warn!(
                        component = "remote_client",
                        event = "remote.call.transient",
                        target_label = label,
                        attempt,
                        max_attempts,
                        error = %err
                    );
                    if attempt >= max_attempts {
                        error!(
                            component = "remote_client",
                            event = "remote.retries_exhausted",
                            target_label = label,
                            attempts = attempt,
                            error = %err
                        );
                        return Err(RemoteError::RetriesExhausted {
                            url: url.to_string(),
                            attempts: attempt,
                            last: err,
                        });
                    }
                    if self.cancel.is_cancelled() {
                        return Err(RemoteError::Cancelled);
                    }
                    self.sleeper.sleep(policy.delay_after(attempt));
                    attempt += 1;
                }
            }
        }
    }
}

fn parse_realtime_body(url: &str, body: &str) -> Result<f64, RemoteError> {
    let malformed = |reason: &str| RemoteError::MalformedResponse {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    if body.trim().is_empty() {
        return Err(malformed("empty body"));
    }
    let payload: Value = serde_json::from_str(body).map_err(|err| malformed(&err.to_string()))?;
    let object = payload
        .as_object()
        .filter(|object| !object.is_empty())
        .ok_or_else(|| malformed("expected a non-empty JSON object"))?;

    match object.get("currvalue") {
        None | Some(Value::Null) => Err(malformed("'currvalue' is missing or null")),
        Some(value) => json_number(value).ok_or_else(|| malformed("'currvalue' is not numeric")),
    }
}

fn parse_history_body(
    url: &str,
    body: &str,
    offset: FixedOffset,
) -> Result<Vec<HistoryPoint>, RemoteError> {
    let malformed = |reason: String| RemoteError::MalformedResponse {
        url: url.to_string(),
        reason,
    };

    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let payload: Value = serde_json::from_str(body).map_err(|err| malformed(err.to_string()))?;
    let rows = match payload {
        Value::Null => return Ok(Vec::new()),
        Value::Object(ref object) if object.is_empty() => return Ok(Vec::new()),
        Value::Array(rows) => rows,
        _ => return Err(malformed("expected a JSON array of [timestamp, value] pairs".to_string())),
    };

    let mut points = Vec::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        let pair = row
            .as_array()
            .filter(|pair| pair.len() >= 2)
            .ok_or_else(|| malformed(format!("row {idx} is not a [timestamp, value] pair")))?;
        let ts_ms = json_i64(&pair[0])
            .ok_or_else(|| malformed(format!("row {idx} has a non-numeric timestamp")))?;
        let ts = offset
            .timestamp_millis_opt(ts_ms)
            .single()
            .ok_or_else(|| malformed(format!("row {idx} timestamp {ts_ms} is out of range")))?;
        let value = match &pair[1] {
            Value::Null => None,
            other => Some(
                json_number(other)
                    .ok_or_else(|| malformed(format!("row {idx} has a non-numeric value")))?,
            ),
        };
        points.push(HistoryPoint { ts, value });
    }

    Ok(points)
}

fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Fractional millis are truncated toward zero.
fn json_i64(value: &Value) -> Option<i64> {
    let truncated = |v: f64| v.is_finite().then(|| v.trunc() as i64);
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().and_then(truncated)),
        Value::String(text) => {
            let text = text.trim();
            text.parse()
                .ok()
                .or_else(|| text.parse::<f64>().ok().and_then(truncated))
        }
        _ => None,
    }
}

fn truncate(body: &str) -> String {
    if body.chars().count() <= MAX_LOGGED_BODY_CHARS {
        body.to_string()
    } else {
        let mut out: String = body.chars().take(MAX_LOGGED_BODY_CHARS).collect();
        out.push_str("...");
        out
    }
}
