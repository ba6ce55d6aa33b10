//! LISTEN/NOTIFY wake-up channel.
//!
//! Notifications carry no payload the engine trusts; a notification only
//! means "go point-fetch the row this referred to." The payload is parsed
//! just far enough to find `(symbol, datetime)`.
//!
//! The connection is owned by one dedicated task ([`run_listener_task`]):
//! it reconnects on its own backoff and enqueues parsed notifications onto
//! a bounded [`mpsc`] channel. It never calls into the store or the cache
//! itself, so a slow point-fetch or cache write on the consuming side can
//! never stall this task's ability to keep listening -- it only ever
//! blocks on enqueue, never on processing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::core::error::{EngineError, EngineResult, UpstreamError};

const RECONNECT_BACKOFF_SECS: u64 = 5;

/// A parsed LISTEN/NOTIFY payload: enough to point-fetch the row it refers
/// to. The wire format is `symbol,RFC3339-datetime`.
#[derive(Debug, Clone)]
pub struct NotifyEvent {
    pub symbol: String,
    pub datetime: DateTime<Utc>,
}

/// One dequeued notification: which channel it arrived on, and the parsed
/// payload.
pub type NotifyMessage = (String, NotifyEvent);

fn parse_payload(payload: &str) -> Option<NotifyEvent> {
    let (symbol, ts) = payload.split_once(',')?;
    let datetime = DateTime::parse_from_rfc3339(ts.trim()).ok()?.with_timezone(&Utc);
    Some(NotifyEvent {
        symbol: symbol.trim().to_string(),
        datetime,
    })
}

/// Owns a single LISTEN connection; nothing else touches it.
struct NotifyListener {
    listener: PgListener,
}

impl NotifyListener {
    async fn connect(database_url: &str, channels: &[&str]) -> EngineResult<Self> {
        let mut listener = PgListener::connect(database_url)
            .await
            .map_err(UpstreamError::from)?;
        listener.listen_all(channels.iter().copied()).await.map_err(UpstreamError::from)?;
        Ok(Self { listener })
    }

    /// Block until the next notification arrives and parses cleanly, log
    /// and skip malformed payloads rather than surfacing them.
    async fn recv(&mut self) -> EngineResult<NotifyMessage> {
        loop {
            let notification = self
                .listener
                .recv()
                .await
                .map_err(|e| UpstreamError::ListenerDisconnected(e.to_string()))?;

            let channel = notification.channel().to_string();
            match parse_payload(notification.payload()) {
                Some(event) => return Ok((channel, event)),
                None => {
                    warn!(payload = notification.payload(), "dropping malformed notification payload");
                    continue;
                }
            }
        }
    }
}

/// Run the listener connection to completion: connect, reconnect on a fixed
/// backoff when the connection drops, and enqueue every parsed notification
/// onto `tx`. Returns once `tx`'s receiver is dropped (the consuming task
/// shut down), since there is no one left to hand notifications to.
pub async fn run_listener_task(database_url: String, channels: Vec<String>, tx: mpsc::Sender<NotifyMessage>) {
    let channel_refs: Vec<&str> = channels.iter().map(String::as_str).collect();
    let mut attempt: u32 = 0;

    loop {
        let mut listener = match NotifyListener::connect(&database_url, &channel_refs).await {
            Ok(l) => {
                attempt = 0;
                l
            }
            Err(err) => {
                attempt += 1;
                log_reconnect_failure(attempt, &err);
                sleep(Duration::from_secs(RECONNECT_BACKOFF_SECS)).await;
                continue;
            }
        };

        info!("listening for candle and metrics notifications");
        loop {
            match listener.recv().await {
                Ok(message) => {
                    if tx.send(message).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    attempt += 1;
                    log_reconnect_failure(attempt, &err);
                    break;
                }
            }
        }
        sleep(Duration::from_secs(RECONNECT_BACKOFF_SECS)).await;
    }
}

fn log_reconnect_failure(attempt: u32, err: &EngineError) {
    error!(attempt, error = %err, "listener reconnect attempt failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::ymd_hms;

    #[test]
    fn parses_well_formed_payload() {
        let event = parse_payload("BTCUSDT,2026-07-27T10:05:00+00:00").unwrap();
        assert_eq!(event.symbol, "BTCUSDT");
        assert_eq!(event.datetime, ymd_hms(2026, 7, 27, 10, 5, 0));
    }

    #[test]
    fn rejects_malformed_payload() {
        assert!(parse_payload("not-a-valid-payload").is_none());
        assert!(parse_payload("BTCUSDT,not-a-date").is_none());
    }
}
