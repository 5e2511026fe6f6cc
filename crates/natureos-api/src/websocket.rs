//! Sensor stream over WebSocket.
//!
//! Opens a single connection to `/devices/{id}/sensor-data/stream` and
//! yields parsed [`StreamEvent`]s until the socket drops. The caller owns
//! the resume cursor and the backoff schedule; a dropped connection just
//! ends the stream.
//!
//! Frames are JSON objects tagged by `type`:
//!
//! ```json
//! {"type": "reading", "data": {"device_id": "esp32-001", "sensor_type": "temperature", ...}}
//! {"type": "cursor_expired", "requested": {...}, "earliest": {...}}
//! {"type": "heartbeat"}
//! ```

use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use url::Url;

use crate::error::Error;
use crate::gateway::{EventStream, FailureKind, StreamEvent, StreamPosition, TransportError};
use crate::models::ReadingRecord;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamFrame {
    Reading {
        data: ReadingRecord,
    },
    CursorExpired {
        #[serde(default)]
        requested: Option<StreamPosition>,
        #[serde(default)]
        earliest: Option<StreamPosition>,
    },
    Heartbeat,
}

/// Rewrite an `http(s)://` URL to the matching `ws(s)://` scheme.
pub(crate) fn websocket_url(http_url: &Url) -> Result<Url, Error> {
    let scheme = if http_url.scheme() == "https" { "wss" } else { "ws" };
    let host = http_url.host_str().unwrap_or("localhost");
    let rebuilt = match http_url.port() {
        Some(p) => format!("{scheme}://{host}:{p}{}", http_url.path()),
        None => format!("{scheme}://{host}{}", http_url.path()),
    };
    let mut url = Url::parse(&rebuilt)?;
    url.set_query(http_url.query());
    Ok(url)
}

/// Establish a stream connection and hand back the event sequence.
///
/// The handshake is bounded by `timeout`; once connected the stream lives
/// until the platform closes it, the socket errors, or the caller drops it.
pub(crate) async fn connect(
    url: &Url,
    headers: Vec<(&'static str, String)>,
    timeout: Duration,
) -> Result<EventStream, Error> {
    tracing::info!(url = %url, "opening sensor stream");

    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let mut request = ClientRequestBuilder::new(uri);
    for (name, value) in headers {
        request = request.with_header(name, value);
    }

    let (mut ws, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| Error::Timeout {
            timeout_secs: timeout.as_secs(),
        })?
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    tracing::debug!("sensor stream connected");

    let events = async_stream::stream! {
        while let Some(frame) = ws.next().await {
            match frame {
                Ok(tungstenite::Message::Text(text)) => {
                    if let Some(event) = parse_frame(&text) {
                        yield Ok(event);
                    }
                }
                Ok(tungstenite::Message::Close(frame)) => {
                    if let Some(ref cf) = frame {
                        tracing::info!(code = %cf.code, reason = %cf.reason, "sensor stream closed by platform");
                    } else {
                        tracing::info!("sensor stream closed by platform (no payload)");
                    }
                    break;
                }
                Err(e) => {
                    yield Err(TransportError::retryable(FailureKind::Closed, e.to_string()));
                    break;
                }
                // Binary, Ping, Pong, Frame -- tungstenite answers pings itself
                Ok(_) => {}
            }
        }
    };

    Ok(Box::pin(events))
}

/// Parse one text frame. Malformed frames are logged and skipped.
fn parse_frame(text: &str) -> Option<StreamEvent> {
    match serde_json::from_str::<StreamFrame>(text) {
        Ok(StreamFrame::Reading { data }) => Some(StreamEvent::Reading(data)),
        Ok(StreamFrame::CursorExpired { requested, earliest }) => {
            Some(StreamEvent::CursorExpired { requested, earliest })
        }
        Ok(StreamFrame::Heartbeat) => Some(StreamEvent::Heartbeat),
        Err(e) => {
            tracing::debug!(error = %e, "failed to parse sensor stream frame");
            None
        }
    }
}
