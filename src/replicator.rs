//! Replication client.
//!
//! Connects to the parent's replication endpoint, resumes from the local
//! `latest_event` cursor, applies every incoming event, and reconnects
//! with exponential backoff when the session fails. Upload events carry
//! no file content on the wire; the body is fetched from the parent's
//! delivery endpoint, and a failed fetch records the event without it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::task;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::schema;
use crate::stash::{Applied, FetchedFile, Stash};
use crate::wire::{self, EventType, ReplicationStart};

/// A session shorter than this counts as a failure streak and grows the
/// backoff; a longer one resets it.
const SESSION_RESET: Duration = Duration::from_secs(5);

/// Backoff doublings cap: 2^5 = 32 seconds.
const MAX_DOUBLINGS: u32 = 5;

pub struct Replicator {
    parent: String,
    stash: Stash,
    credentials: Arc<Credentials>,
    metrics: Metrics,
    http: reqwest::Client,
}

impl Replicator {
    pub fn new(
        parent: String,
        stash: Stash,
        credentials: Arc<Credentials>,
        metrics: Metrics,
    ) -> Self {
        Self {
            parent,
            stash,
            credentials,
            metrics,
            http: reqwest::Client::new(),
        }
    }

    pub fn spawn(self) -> task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Replicate forever, backing off after failures.
    pub async fn run(self) {
        let mut failures: u32 = 0;
        loop {
            let started = Instant::now();
            if let Err(e) = self.replicate_until_error().await {
                warn!("replication error: {e}");
            }
            failures = next_failure_count(failures, started.elapsed());
            if let Some(delay) = backoff_delay(failures) {
                info!("backing off for {}s", delay.as_secs());
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn replicate_until_error(&self) -> Result<()> {
        let endpoint = replication_endpoint(&self.parent)?;

        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Network(e.to_string()))?;
        let auth = HeaderValue::from_str(&self.credentials.basic_header())
            .map_err(|e| Error::Internal(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (mut ws, _) = connect_async(request).await?;

        let cursor = self.latest_event().await?;
        debug!(cursor = %cursor, "resuming replication");
        let start = ReplicationStart { event: cursor };
        ws.send(Message::Binary(start.encode_to_vec().into()))
            .await?;

        loop {
            let message = match ws.next().await {
                Some(message) => message?,
                None => return Err(Error::Network("replication connection closed".into())),
            };
            let raw = match message {
                Message::Binary(bytes) => bytes,
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                Message::Close(_) => {
                    return Err(Error::Network("replication connection closed".into()))
                }
                Message::Text(_) => {
                    return Err(Error::Codec("unexpected text frame from parent".into()))
                }
            };

            let event = wire::decode_event(&raw)?;

            // A duplicate is dropped before anything else looks at it, so
            // a redelivered event never fails the session, whatever its
            // type.
            if self.have_event(&event.id).await? {
                debug!("ignoring duplicate event {}", event.id);
                continue;
            }

            let kind = event
                .kind()
                .ok_or_else(|| Error::Codec(format!("unknown event type {}", event.r#type)))?;

            let body = match kind {
                EventType::Upload => match self.download(&event.drawer, &event.filename).await {
                    Ok(file) => Some(file),
                    Err(e) => {
                        warn!(
                            "downloading {}:{} failed, recording event without content: {e}",
                            event.drawer, event.filename
                        );
                        None
                    }
                },
                EventType::Delete => None,
            };

            match self
                .stash
                .apply_replicated(event.clone(), raw.to_vec(), body)
                .await?
            {
                Applied::Fresh => {
                    self.metrics.replicated_events_total.inc();
                    info!("replicated {} to {}:{}", event.id, event.drawer, event.filename);
                }
                Applied::Duplicate => debug!("ignoring duplicate event {}", event.id),
            }
        }
    }

    async fn latest_event(&self) -> Result<String> {
        let store = self.stash.store().clone();
        let latest = task::spawn_blocking(move || store.get(schema::LATEST_EVENT))
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;
        Ok(latest
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .unwrap_or_else(|| "event:0".to_string()))
    }

    async fn have_event(&self, id: &str) -> Result<bool> {
        let store = self.stash.store().clone();
        let id = id.as_bytes().to_vec();
        task::spawn_blocking(move || store.has(&id))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn download(&self, drawer: &str, filename: &str) -> Result<FetchedFile> {
        let url = format!("{}/{drawer}/{filename}", self.parent.trim_end_matches('/'));
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok(FetchedFile {
            content: response.bytes().await?.to_vec(),
            content_type,
        })
    }
}

/// Map the parent's HTTP URL to its replication WebSocket endpoint.
fn replication_endpoint(parent: &str) -> Result<url::Url> {
    let mut url = url::Url::parse(parent)
        .map_err(|e| Error::validation(format!("invalid parent URL {parent:?}: {e}")))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(Error::validation(format!("unknown URL scheme {other:?}")));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::validation(format!("invalid parent URL {parent:?}")))?;
    url.set_path(&format!("{}/api/repl", url.path().trim_end_matches('/')));
    Ok(url)
}

/// Advance the failure streak after a session ended: short sessions grow
/// it toward the cap, surviving five seconds resets it.
fn next_failure_count(count: u32, session: Duration) -> u32 {
    if session < SESSION_RESET {
        (count + 1).min(MAX_DOUBLINGS)
    } else {
        0
    }
}

/// The sleep before the next attempt: 2^count seconds, or none when the
/// streak is clear.
fn backoff_delay(count: u32) -> Option<Duration> {
    (count > 0).then(|| Duration::from_secs(1 << count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_upgrades_http_to_ws() {
        let url = replication_endpoint("http://parent:8080").unwrap();
        assert_eq!(url.as_str(), "ws://parent:8080/api/repl");
    }

    #[test]
    fn endpoint_upgrades_https_to_wss() {
        let url = replication_endpoint("https://parent").unwrap();
        assert_eq!(url.as_str(), "wss://parent/api/repl");
    }

    #[test]
    fn endpoint_rejects_other_schemes() {
        assert!(matches!(
            replication_endpoint("ftp://parent"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            replication_endpoint("not a url"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn backoff_doubles_to_a_cap_of_32_seconds() {
        let failure = Duration::from_millis(10);
        let mut count = 0;
        let mut delays = Vec::new();
        for _ in 0..7 {
            count = next_failure_count(count, failure);
            delays.push(backoff_delay(count).unwrap().as_secs());
        }
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 32, 32]);
    }

    #[test]
    fn long_session_resets_the_backoff() {
        let mut count = 0;
        for _ in 0..4 {
            count = next_failure_count(count, Duration::from_millis(10));
        }
        assert_eq!(backoff_delay(count).unwrap().as_secs(), 16);

        count = next_failure_count(count, Duration::from_secs(6));
        assert_eq!(count, 0);
        assert_eq!(backoff_delay(count), None);

        count = next_failure_count(count, Duration::from_millis(10));
        assert_eq!(backoff_delay(count).unwrap().as_secs(), 2);
    }
}
