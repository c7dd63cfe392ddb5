//! In-process event bus.
//!
//! A single dispatcher task owns the subscriber map; publish, subscribe
//! and unsubscribe arrive as messages on its mailbox, so bus state has
//! exactly one writer and delivery order is the same for every
//! subscriber. A subscriber registered at time T receives every event
//! published after T.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Error, Result};
use crate::wire::Event;

/// Per-subscriber sink capacity. A full sink blocks delivery to every
/// remaining subscriber until it drains; sessions must consume promptly.
pub const SINK_CAPACITY: usize = 16;

const MAILBOX_CAPACITY: usize = 64;

enum Command {
    Publish(Event),
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        id: u64,
    },
}

/// A live subscription: the id used to unsubscribe and the receiving end
/// of the subscriber sink. Its lifetime equals the session that holds it.
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::Receiver<Event>,
}

/// Cloneable handle to the dispatcher task.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Command>,
}

impl EventBus {
    pub async fn publish(&self, event: Event) {
        // The dispatcher outlives every handle; a failed send only happens
        // during teardown and loses nothing durable.
        let _ = self.tx.send(Command::Publish(event)).await;
    }

    pub async fn subscribe(&self) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Subscribe { reply })
            .await
            .map_err(|_| Error::Internal("event dispatcher is gone".into()))?;
        rx.await
            .map_err(|_| Error::Internal("event dispatcher dropped the subscription".into()))
    }

    pub async fn unsubscribe(&self, id: u64) {
        let _ = self.tx.send(Command::Unsubscribe { id }).await;
    }
}

/// Start the dispatcher task and return a handle to it.
pub fn spawn_dispatcher() -> EventBus {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    tokio::spawn(dispatch(rx));
    EventBus { tx }
}

async fn dispatch(mut rx: mpsc::Receiver<Command>) {
    let mut subscribers: HashMap<u64, mpsc::Sender<Event>> = HashMap::new();
    let mut next_id: u64 = 0;

    while let Some(command) = rx.recv().await {
        match command {
            Command::Publish(event) => {
                debug!(id = %event.id, drawer = %event.drawer, "event");
                let mut gone = Vec::new();
                for (id, sink) in &subscribers {
                    if sink.send(event.clone()).await.is_err() {
                        gone.push(*id);
                    }
                }
                for id in gone {
                    subscribers.remove(&id);
                }
            }
            Command::Subscribe { reply } => {
                let (sink, events) = mpsc::channel(SINK_CAPACITY);
                let id = next_id;
                next_id += 1;
                subscribers.insert(id, sink);
                let _ = reply.send(Subscription { id, events });
            }
            Command::Unsubscribe { id } => {
                subscribers.remove(&id);
            }
        }
    }
}
