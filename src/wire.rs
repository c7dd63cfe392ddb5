//! Wire records for mutation events, file metadata, and the replication
//! handshake.
//!
//! One encoded record per WebSocket frame. Field numbers are part of the
//! wire contract and must not change. Relays forward and store the raw
//! frame bytes instead of re-encoding, so fields unknown to this version
//! survive the trip through intermediate nodes.

use prost::Message;

use crate::error::{Error, Result};

/// A single mutation of the store.
#[derive(Clone, PartialEq, Message)]
pub struct Event {
    #[prost(enumeration = "EventType", tag = "1")]
    pub r#type: i32,
    #[prost(string, tag = "2")]
    pub drawer: String,
    #[prost(string, tag = "3")]
    pub filename: String,
    /// The event's own store key (`event:<timestamp>`), carried inside the
    /// record so receivers can deduplicate across the wire.
    #[prost(string, tag = "4")]
    pub id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum EventType {
    Upload = 1,
    Delete = 2,
}

/// Metadata stored alongside a file blob.
#[derive(Clone, PartialEq, Message)]
pub struct MetaData {
    #[prost(string, tag = "1")]
    pub content_type: String,
    /// Original URL for files ingested via the store endpoint.
    #[prost(string, optional, tag = "2")]
    pub source: Option<String>,
}

/// First message a downstream peer sends on the replication wire.
#[derive(Clone, PartialEq, Message)]
pub struct ReplicationStart {
    /// Cursor: the key of the last event the peer has applied.
    #[prost(string, tag = "1")]
    pub event: String,
}

impl Event {
    pub fn new(kind: EventType, drawer: &str, filename: &str, id: &str) -> Self {
        Self {
            r#type: kind as i32,
            drawer: drawer.to_string(),
            filename: filename.to_string(),
            id: id.to_string(),
        }
    }

    /// The event type, or `None` when the numeric value is unknown to this
    /// version (an incompatible peer).
    pub fn kind(&self) -> Option<EventType> {
        EventType::try_from(self.r#type).ok()
    }
}

pub fn decode_event(bytes: &[u8]) -> Result<Event> {
    Event::decode(bytes).map_err(Error::from)
}

pub fn decode_metadata(bytes: &[u8]) -> Result<MetaData> {
    MetaData::decode(bytes).map_err(Error::from)
}

pub fn decode_replication_start(bytes: &[u8]) -> Result<ReplicationStart> {
    ReplicationStart::decode(bytes).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_roundtrip() {
        let event = Event::new(EventType::Upload, "test", "abc.foo", "event:00000000000000000001");
        let bytes = event.encode_to_vec();
        let decoded = decode_event(&bytes).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.kind(), Some(EventType::Upload));
    }

    #[test]
    fn delete_event_roundtrip() {
        let event = Event::new(EventType::Delete, "d", "f", "event:00000000000000000002");
        let decoded = decode_event(&event.encode_to_vec()).unwrap();
        assert_eq!(decoded.kind(), Some(EventType::Delete));
        assert_eq!(decoded.drawer, "d");
        assert_eq!(decoded.filename, "f");
    }

    #[test]
    fn unknown_event_type_is_preserved_but_unclassified() {
        let mut event = Event::new(EventType::Upload, "d", "f", "event:1");
        event.r#type = 99;
        let decoded = decode_event(&event.encode_to_vec()).unwrap();
        assert_eq!(decoded.r#type, 99);
        assert_eq!(decoded.kind(), None);
    }

    #[test]
    fn metadata_roundtrip_with_and_without_source() {
        let bare = MetaData {
            content_type: "text/plain".into(),
            source: None,
        };
        assert_eq!(decode_metadata(&bare.encode_to_vec()).unwrap(), bare);

        let sourced = MetaData {
            content_type: "image/png".into(),
            source: Some("http://origin/pic.png".into()),
        };
        assert_eq!(decode_metadata(&sourced.encode_to_vec()).unwrap(), sourced);
    }

    #[test]
    fn replication_start_roundtrip() {
        let start = ReplicationStart {
            event: "event:0".into(),
        };
        let decoded = decode_replication_start(&start.encode_to_vec()).unwrap();
        assert_eq!(decoded.event, "event:0");
    }

    #[test]
    fn decode_tolerates_unknown_fields() {
        let mut bytes = Event::new(EventType::Upload, "d", "f", "event:1").encode_to_vec();
        // Append an unknown varint field (tag 15) as a newer peer would.
        bytes.extend_from_slice(&[0x78, 0x2a]);
        let decoded = decode_event(&bytes).unwrap();
        assert_eq!(decoded.drawer, "d");
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(decode_event(&[0xff, 0xff, 0xff, 0xff]).is_err());
        assert!(decode_replication_start(&[0xff]).is_err());
    }
}
