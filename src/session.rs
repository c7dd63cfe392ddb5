//! Per-peer replication server session.
//!
//! A downstream peer opens the replication WebSocket, sends one
//! `ReplicationStart` carrying its cursor, and then only receives. The
//! session subscribes to the event bus BEFORE scanning history, so no
//! event can fall between the catch-up and live phases: events published
//! during catch-up pile up in a bounded FIFO and are forwarded
//! afterwards. A full FIFO stops draining the subscriber sink, at which
//! point the dispatcher's blocking policy takes over. The handover may
//! send a few keys twice; receiver-side deduplication makes that
//! harmless.
//!
//! Task layout per session:
//! - a caching task accumulating live bus events into the FIFO,
//! - a forwarding task sending historical pages then the FIFO,
//! - a reader task that only watches the socket for EOF or errors.
//!
//! Any of the three firing the cancellation token tears the session
//! down: unsubscribe from the bus first, then drop the receiving end.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use prost::Message as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::schema;
use crate::store::Store;
use crate::wire::{self, Event};

/// Events sent per catch-up scan before re-anchoring the range.
const CATCHUP_PAGE: usize = 256;

/// Bound of the per-session live-event FIFO. The bound trades memory for
/// the drift a peer may accumulate during catch-up before the dispatcher
/// starts blocking on this session's sink.
const CACHE_CAPACITY: usize = 1024;

/// Run one replication session until the peer disconnects or the wire
/// breaks.
pub async fn run(mut socket: WebSocket, store: Arc<Store>, bus: EventBus) {
    let Some(cursor) = read_handshake(&mut socket).await else {
        return;
    };
    info!(cursor = %cursor, "replication peer connected");

    let subscription = match bus.subscribe().await {
        Ok(s) => s,
        Err(e) => {
            warn!("subscribing replication session failed: {e}");
            return;
        }
    };
    let subscriber_id = subscription.id;

    let (ws_tx, ws_rx) = socket.split();
    let cancel = CancellationToken::new();
    let (raw_tx, raw_rx) = mpsc::channel::<Vec<u8>>(1);

    let caching = tokio::spawn(cache_events(
        subscription.events,
        raw_tx,
        cancel.clone(),
        CACHE_CAPACITY,
    ));
    let forwarding = tokio::spawn(forward_events(ws_tx, store, cursor, raw_rx, cancel.clone()));
    let reading = tokio::spawn(watch_peer(ws_rx, cancel.clone()));

    cancel.cancelled().await;

    // Unsubscribe before the caching task drops the receiving end.
    bus.unsubscribe(subscriber_id).await;
    let _ = tokio::join!(caching, forwarding, reading);
    info!("replication session closed");
}

/// Read and validate the peer's `ReplicationStart`. Returns the cursor,
/// or `None` when the handshake is broken and the session must close.
async fn read_handshake(socket: &mut WebSocket) -> Option<String> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Binary(bytes))) => {
                let start = match wire::decode_replication_start(&bytes) {
                    Ok(start) => start,
                    Err(e) => {
                        warn!("decoding replication handshake failed: {e}");
                        return None;
                    }
                };
                if !start.event.starts_with(schema::EVENT_PREFIX) {
                    warn!("got invalid replication cursor: {:?}", start.event);
                    return None;
                }
                return Some(start.event);
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(_)) => {
                warn!("replication handshake must be a binary frame");
                return None;
            }
            Some(Err(e)) => {
                warn!("receiving replication handshake failed: {e}");
                return None;
            }
            None => return None,
        }
    }
}

/// Buffer live bus events while catch-up runs, then keep feeding the
/// forwarding task in arrival order. The FIFO holds at most `capacity`
/// events; once full, the subscriber sink is no longer drained, so the
/// sink fills and the dispatcher blocks on it.
async fn cache_events(
    mut events: mpsc::Receiver<Event>,
    out: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    capacity: usize,
) {
    let mut buffered: VecDeque<Vec<u8>> = VecDeque::new();

    loop {
        if buffered.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => buffered.push_back(event.encode_to_vec()),
                    None => break,
                },
            }
        } else if buffered.len() < capacity {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => buffered.push_back(event.encode_to_vec()),
                    None => break,
                },
                permit = out.reserve() => match permit {
                    Ok(permit) => {
                        if let Some(raw) = buffered.pop_front() {
                            permit.send(raw);
                        }
                    }
                    Err(_) => return,
                },
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return,
                permit = out.reserve() => match permit {
                    Ok(permit) => {
                        if let Some(raw) = buffered.pop_front() {
                            permit.send(raw);
                        }
                    }
                    Err(_) => return,
                },
            }
        }
    }

    // Subscription ended; hand over whatever is still buffered.
    while let Some(raw) = buffered.pop_front() {
        if out.send(raw).await.is_err() {
            return;
        }
    }
}

/// Send historical events from the cursor in key order, then live events
/// in publish order. Cancels the session when the wire fails.
async fn forward_events(
    mut ws_tx: SplitSink<WebSocket, Message>,
    store: Arc<Store>,
    cursor: String,
    mut raw_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let _guard = cancel.drop_guard();

    let mut start = cursor.into_bytes();
    loop {
        let store = store.clone();
        let from = start.clone();
        let page = match tokio::task::spawn_blocking(move || {
            store.scan(&from, schema::EVENT_RANGE_END, CATCHUP_PAGE)
        })
        .await
        {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                warn!("catch-up scan failed: {e}");
                return;
            }
            Err(e) => {
                warn!("catch-up scan task failed: {e}");
                return;
            }
        };

        let exhausted = page.len() < CATCHUP_PAGE;
        for (key, value) in page {
            if ws_tx.send(Message::Binary(value.into())).await.is_err() {
                debug!("peer went away during catch-up");
                return;
            }
            start = key;
        }
        if exhausted {
            break;
        }
        // Anchor the next page just past the last key sent.
        start.push(0);
    }

    while let Some(raw) = raw_rx.recv().await {
        if ws_tx.send(Message::Binary(raw.into())).await.is_err() {
            debug!("peer went away during live forwarding");
            return;
        }
    }
}

/// The peer never sends after the handshake; this task exists only to
/// notice EOF or a wire error and stop the session.
async fn watch_peer(mut ws_rx: SplitStream<WebSocket>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            message = ws_rx.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    debug!("replication peer disconnected");
                    cancel.cancel();
                    return;
                }
                Some(Ok(_)) => continue,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::EventType;
    use std::time::Duration;

    fn event(id: &str) -> Event {
        Event::new(EventType::Upload, "d", "f", id)
    }

    #[tokio::test]
    async fn cache_preserves_order_while_downstream_is_blocked() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(cache_events(in_rx, out_tx, cancel, CACHE_CAPACITY));

        // Nobody reads `out_rx` yet; everything must pile up in the FIFO.
        for i in 0..8 {
            in_tx.send(event(&format!("event:{i:020}"))).await.unwrap();
        }
        drop(in_tx);

        for i in 0..8 {
            let raw = out_rx.recv().await.unwrap();
            let decoded = wire::decode_event(&raw).unwrap();
            assert_eq!(decoded.id, format!("event:{i:020}"));
        }
        assert_eq!(out_rx.recv().await, None);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn full_cache_stops_draining_the_sink() {
        let (in_tx, in_rx) = mpsc::channel(2);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(cache_events(in_rx, out_tx, cancel, 3));

        // With nobody reading the wire side, one event can sit in the
        // outgoing channel, three in the FIFO and two in the sink; the
        // seventh send must block, which is what lets the dispatcher's
        // blocking policy reach this subscriber.
        for i in 0..6 {
            in_tx.send(event(&format!("event:{i:020}"))).await.unwrap();
        }
        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            in_tx.send(event("event:overflow")),
        )
        .await;
        assert!(blocked.is_err(), "a full cache must stop draining the sink");

        // Reading the wire side drains everything, still in order.
        drop(in_tx);
        for i in 0..6 {
            let raw = out_rx.recv().await.unwrap();
            let decoded = wire::decode_event(&raw).unwrap();
            assert_eq!(decoded.id, format!("event:{i:020}"));
        }
        assert_eq!(out_rx.recv().await, None);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn cache_discards_buffer_on_cancel() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(cache_events(in_rx, out_tx, cancel.clone(), CACHE_CAPACITY));

        in_tx.send(event("event:1")).await.unwrap();
        cancel.cancel();
        task.await.unwrap();

        // At most one event can already sit in the capacity-1 channel;
        // the rest of the FIFO is discarded and the sender side is gone.
        let mut drained = 0;
        while out_rx.recv().await.is_some() {
            drained += 1;
        }
        assert!(drained <= 1);
    }
}
