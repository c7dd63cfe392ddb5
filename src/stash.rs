//! Storage layer: one atomic batch per mutation.
//!
//! Every mutation writes its file data, metadata, one event record and
//! the `latest_event` pointer in a single batch, then publishes the
//! event on the bus. Key minting and commit happen under one writer
//! lock, so event-key order equals commit order and `latest_event`
//! never regresses.

use std::sync::{Arc, Mutex};

use prost::Message;
use tokio::task;

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::schema::{self, EventClock};
use crate::store::{Batch, Store};
use crate::wire::{Event, EventType, MetaData};

/// A file submitted for upload.
pub struct NewFile {
    pub content: Vec<u8>,
    pub content_type: String,
    /// Original URL when the file was ingested from elsewhere.
    pub source: Option<String>,
    /// Filename extension to append, without the dot.
    pub ext: Option<String>,
}

/// A file body fetched from the parent for a replicated upload.
pub struct FetchedFile {
    pub content: Vec<u8>,
    pub content_type: String,
}

/// Outcome of [`Stash::apply_replicated`].
#[derive(Debug, PartialEq, Eq)]
pub enum Applied {
    /// The event was new and has been recorded.
    Fresh,
    /// The event id already existed locally; nothing changed.
    Duplicate,
}

#[derive(Clone)]
pub struct Stash {
    store: Arc<Store>,
    bus: EventBus,
    clock: Arc<EventClock>,
    write_lock: Arc<Mutex<()>>,
}

impl Stash {
    pub fn new(store: Arc<Store>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            clock: Arc::new(EventClock::new()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Store the given files in one atomic batch and publish one UPLOAD
    /// event per file, in input order. Returns the generated filenames,
    /// in input order.
    pub async fn upload(&self, drawer: &str, files: Vec<NewFile>) -> Result<Vec<String>> {
        if !schema::valid_drawer_name(drawer) {
            return Err(Error::validation(format!("invalid drawer name {drawer:?}")));
        }

        let this = self.clone();
        let drawer = drawer.to_string();
        let (filenames, events) =
            task::spawn_blocking(move || this.commit_upload(&drawer, files))
                .await
                .map_err(|e| Error::Internal(e.to_string()))??;

        for event in events {
            self.bus.publish(event).await;
        }
        Ok(filenames)
    }

    fn commit_upload(&self, drawer: &str, files: Vec<NewFile>) -> Result<(Vec<String>, Vec<Event>)> {
        let _serial = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut batch = Batch::new();
        let mut filenames = Vec::with_capacity(files.len());
        let mut events = Vec::with_capacity(files.len());

        for file in files {
            let filename = schema::random_filename(file.ext.as_deref());
            batch.put(schema::file_key(drawer, &filename), file.content);

            let metadata = MetaData {
                content_type: file.content_type,
                source: file.source,
            };
            batch.put(schema::meta_key(drawer, &filename), metadata.encode_to_vec());

            let id = self.clock.next_key();
            let event = Event::new(EventType::Upload, drawer, &filename, &id);
            batch.put(id.as_bytes(), event.encode_to_vec());
            batch.put(schema::LATEST_EVENT, id.as_bytes());

            filenames.push(filename);
            events.push(event);
        }

        self.store.write(batch)?;
        Ok((filenames, events))
    }

    /// Remove a file and its metadata in one atomic batch and publish the
    /// DELETE event. Deleting a file that does not exist still records
    /// the event; the operation is an idempotent tombstone.
    pub async fn delete(&self, drawer: &str, filename: &str) -> Result<()> {
        let this = self.clone();
        let drawer = drawer.to_string();
        let filename = filename.to_string();
        let event = task::spawn_blocking(move || this.commit_delete(&drawer, &filename))
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;

        self.bus.publish(event).await;
        Ok(())
    }

    fn commit_delete(&self, drawer: &str, filename: &str) -> Result<Event> {
        let _serial = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut batch = Batch::new();
        batch.delete(schema::file_key(drawer, filename));
        batch.delete(schema::meta_key(drawer, filename));

        let id = self.clock.next_key();
        let event = Event::new(EventType::Delete, drawer, filename, &id);
        batch.put(id.as_bytes(), event.encode_to_vec());
        batch.put(schema::LATEST_EVENT, id.as_bytes());

        self.store.write(batch)?;
        Ok(event)
    }

    /// Apply an event received from a parent.
    ///
    /// The raw wire bytes are recorded under the event's own id, so the
    /// record survives relaying byte-for-byte. An id that already exists
    /// is a no-op (`Duplicate`): nothing is written and nothing is
    /// published, which is what terminates propagation around a ring.
    /// The duplicate check comes before everything else, including the
    /// event-type check, so a redelivered event of an unknown type is
    /// still just a duplicate. For uploads `body` is `None` when the
    /// content fetch failed; the event is then recorded without the
    /// file.
    pub async fn apply_replicated(
        &self,
        event: Event,
        raw: Vec<u8>,
        body: Option<FetchedFile>,
    ) -> Result<Applied> {
        if !event.id.starts_with(schema::EVENT_PREFIX) {
            return Err(Error::validation(format!("invalid event id {:?}", event.id)));
        }

        let this = self.clone();
        let applied_event = event.clone();
        let applied = task::spawn_blocking(move || this.commit_replicated(&applied_event, raw, body))
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;

        if applied == Applied::Fresh {
            self.bus.publish(event).await;
        }
        Ok(applied)
    }

    fn commit_replicated(
        &self,
        event: &Event,
        raw: Vec<u8>,
        body: Option<FetchedFile>,
    ) -> Result<Applied> {
        let _serial = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.store.has(event.id.as_bytes())? {
            return Ok(Applied::Duplicate);
        }

        let mut batch = Batch::new();
        batch.put(event.id.as_bytes(), raw);
        batch.put(schema::LATEST_EVENT, event.id.as_bytes());

        match event.kind() {
            Some(EventType::Upload) => {
                if let Some(body) = body {
                    batch.put(schema::file_key(&event.drawer, &event.filename), body.content);
                    let metadata = MetaData {
                        content_type: body.content_type,
                        source: None,
                    };
                    batch.put(
                        schema::meta_key(&event.drawer, &event.filename),
                        metadata.encode_to_vec(),
                    );
                }
            }
            Some(EventType::Delete) => {
                batch.delete(schema::file_key(&event.drawer, &event.filename));
                batch.delete(schema::meta_key(&event.drawer, &event.filename));
            }
            None => {
                return Err(Error::Codec(format!("unknown event type {}", event.r#type)));
            }
        }

        self.store.write(batch)?;
        Ok(Applied::Fresh)
    }
}
