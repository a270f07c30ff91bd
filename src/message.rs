//! KVMessage: a self-describing key-value record carrying
//! `{key, sequence, uuid, properties, body}`, framed as five length-prefixed
//! frames over a TCP stream (the byte-oriented analogue of the five-part
//! ZeroMQ multipart message this design is modeled on).

use crate::error::{CacheError, Result};
use std::convert::TryInto;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Number of frames in one KVMessage. Frames 0..3 are "more follows",
/// frame 4 is the terminator of the group.
const FRAME_COUNT: u8 = 5;

/// Maximum length of the KEY frame in bytes.
pub const MAX_KEY_LEN: usize = 255;

/// Well-known property name selecting which MemCache a message belongs to.
pub const PROP_CACHE_ID: &str = "cacheidstr";
/// Well-known property name carrying the absolute expiry (epoch-ms) of a key.
pub const PROP_TTL: &str = "ttl";
/// Well-known property name flagging a message as a TTL-driven deletion.
pub const PROP_TTLD: &str = "ttld";

/// A single key-value record as it travels on the replication bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvMessage {
    key: Vec<u8>,
    sequence: u64,
    uuid: [u8; 16],
    // Stored in insertion order; `set_prop` does remove-then-append so the
    // encoded form is always last-write-wins per name.
    properties: Vec<(String, String)>,
    body: Vec<u8>,
}

impl KvMessage {
    /// Construct an empty message with the given sequence number.
    pub fn new(sequence: u64) -> Self {
        Self {
            key: Vec::new(),
            sequence,
            uuid: *Uuid::new_v4().as_bytes(),
            properties: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Set the key. Truncation is the caller's responsibility; keys over
    /// `MAX_KEY_LEN` are a caller bug, not something we silently fix up.
    pub fn set_key(&mut self, key: impl Into<Vec<u8>>) {
        self.key = key.into();
    }

    /// Return the key as a UTF-8 string, or the empty string if invalid.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Return the key as a `&str`, replacing invalid UTF-8 with the empty string.
    pub fn key_str(&self) -> &str {
        std::str::from_utf8(&self.key).unwrap_or("")
    }

    /// Set the message body. An empty body means "delete".
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// Return the message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Return the body length.
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// True if this message represents a SET (non-empty body).
    pub fn is_set(&self) -> bool {
        !self.body.is_empty()
    }

    /// Replace this message's UUID with a freshly generated one.
    pub fn set_uuid(&mut self) {
        self.uuid = *Uuid::new_v4().as_bytes();
    }

    /// Overwrite the UUID with an explicit 16-byte value, e.g. when
    /// duplicating a message for replay.
    pub fn set_uuid_bytes(&mut self, uuid: [u8; 16]) {
        self.uuid = uuid;
    }

    /// Return the 16-byte UUID.
    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    /// Overwrite the sequence number.
    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Return the sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Set a `name=value` property, replacing any existing entry with the
    /// same name (scan, remove, append) so the last call wins.
    pub fn set_prop(&mut self, name: &str, value: impl Into<String>) {
        self.properties.retain(|(n, _)| n != name);
        self.properties.push((name.to_string(), value.into()));
    }

    /// Read a property, or the empty string if it was never set.
    pub fn get_prop(&self, name: &str) -> &str {
        self.properties
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    /// Deep copy this message, UUID included — used to fan the same
    /// client-originated write out to every known replica so the
    /// pending-queue dedup on the passive side can recognize the two
    /// copies as one write.
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    fn encode_properties(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (name, value) in &self.properties {
            buf.extend_from_slice(name.as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(value.as_bytes());
            buf.push(b'\n');
        }
        buf
    }

    fn decode_properties(buf: &[u8]) -> Vec<(String, String)> {
        let mut props = Vec::new();
        let text = String::from_utf8_lossy(buf);
        for line in text.split('\n') {
            if line.is_empty() {
                continue;
            }
            if let Some(eq) = line.find('=') {
                props.push((line[..eq].to_string(), line[eq + 1..].to_string()));
            }
        }
        props
    }

    /// Write all five frames, in order, to an async writer. Each frame is a
    /// separate length-prefixed unit; empty/absent frames are sent as
    /// zero-length.
    pub async fn send<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(FRAME_COUNT).await?;
        write_frame(writer, &self.key).await?;
        write_frame(writer, &self.sequence.to_be_bytes()).await?;
        write_frame(writer, &self.uuid).await?;
        write_frame(writer, &self.encode_properties()).await?;
        write_frame(writer, &self.body).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read exactly five frames from an async reader and reconstruct the
    /// message. Fails if the frame-count indicator is not `FRAME_COUNT`.
    pub async fn recv<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let frame_count = reader.read_u8().await?;
        if frame_count != FRAME_COUNT {
            return Err(CacheError::Decode(format!(
                "expected {} frames, group indicator said {}",
                FRAME_COUNT, frame_count
            )));
        }

        let key = read_frame(reader).await?;
        let sequence_bytes = read_frame(reader).await?;
        let sequence = u64::from_be_bytes(
            sequence_bytes
                .try_into()
                .map_err(|_| CacheError::Decode("malformed SEQUENCE frame".into()))?,
        );
        let uuid_bytes = read_frame(reader).await?;
        let uuid: [u8; 16] = uuid_bytes
            .try_into()
            .map_err(|_| CacheError::Decode("malformed UUID frame".into()))?;
        let properties_bytes = read_frame(reader).await?;
        let properties = Self::decode_properties(&properties_bytes);
        let body = read_frame(reader).await?;

        Ok(Self {
            key,
            sequence,
            uuid,
            properties,
            body,
        })
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Literal request frame used on the snapshot endpoint.
pub const GETSNAPSHOT: &str = "GETSNAPSHOT";

/// Well-known keys used for snapshot framing messages (§4.5).
pub const KEY_BEGINMEMCACHE: &str = "BEGINMEMCACHE";
/// Terminates a snapshot stream.
pub const KEY_ENDSNAPSHOT: &str = "ENDSNAPSHOT";
/// Heartbeat key published once per second on the update bus.
pub const KEY_HUGZ: &str = "HUGZ";

/// A `GETSNAPSHOT` request, optionally carrying a subtree prefix filter
/// (the open question from spec.md §9: the client now forwards `subtree`
/// instead of silently dropping it).
pub async fn send_snapshot_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    subtree: &[u8],
) -> Result<()> {
    write_frame(writer, GETSNAPSHOT.as_bytes()).await?;
    write_frame(writer, subtree).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a `GETSNAPSHOT` request and its subtree frame.
pub async fn recv_snapshot_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let verb = read_frame(reader).await?;
    if verb != GETSNAPSHOT.as_bytes() {
        return Err(CacheError::Decode("expected GETSNAPSHOT request".into()));
    }
    read_frame(reader).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_all_fields() {
        let mut msg = KvMessage::new(42);
        msg.set_key(b"alpha".to_vec());
        msg.set_prop(PROP_CACHE_ID, "c0");
        msg.set_prop(PROP_TTL, "123");
        msg.set_body(b"hello".to_vec());

        let mut buf = Vec::new();
        msg.send(&mut buf).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = KvMessage::recv(&mut cursor).await.unwrap();

        assert_eq!(decoded.key(), b"alpha");
        assert_eq!(decoded.sequence(), 42);
        assert_eq!(decoded.uuid(), msg.uuid());
        assert_eq!(decoded.get_prop(PROP_CACHE_ID), "c0");
        assert_eq!(decoded.get_prop(PROP_TTL), "123");
        assert_eq!(decoded.body(), b"hello");
    }

    #[test]
    fn set_prop_last_write_wins() {
        let mut msg = KvMessage::new(0);
        msg.set_prop("ttl", "1");
        msg.set_prop("ttl", "2");
        assert_eq!(msg.get_prop("ttl"), "2");
        assert_eq!(msg.get_prop("missing"), "");
    }

    #[test]
    fn empty_body_means_delete() {
        let msg = KvMessage::new(0);
        assert!(!msg.is_set());
    }

    #[tokio::test]
    async fn rejects_wrong_frame_count() {
        let mut buf = Vec::new();
        buf.push(3u8); // malformed group indicator
        let mut cursor = std::io::Cursor::new(buf);
        let err = KvMessage::recv(&mut cursor).await;
        assert!(err.is_err());
    }
}
