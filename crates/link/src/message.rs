//! Self-describing messages over a [`Channel`].
//!
//! Every message is written as one envelope:
//!
//! ```text
//! u16 tag length | tag (UTF-8) | u32 body length | body (MessagePack)
//! ```
//!
//! The receiver resolves the tag through a [`MessageRegistry`], an explicit
//! tag → decoder map built at start-up, and hands back an [`Envelope`] that
//! can be downcast to the concrete message type.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::error::LinkError;

/// A message shape that can travel over a [`MessageChannel`].
pub trait WireMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Stable identifier written ahead of the body.
    const TAG: &'static str;
}

type DecodeFn = fn(&[u8]) -> Result<Box<dyn Any + Send>, rmp_serde::decode::Error>;

fn decode_boxed<M: WireMessage>(body: &[u8]) -> Result<Box<dyn Any + Send>, rmp_serde::decode::Error> {
    Ok(Box::new(rmp_serde::from_slice::<M>(body)?))
}

/// Maps message tags to the decoder for their shape.
#[derive(Clone, Default)]
pub struct MessageRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `M` receivable.
    pub fn register<M: WireMessage>(&mut self) -> &mut Self {
        if self.decoders.insert(M::TAG, decode_boxed::<M>).is_some() {
            warn!(tag = M::TAG, "message tag registered twice");
        }
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<M: WireMessage>(mut self) -> Self {
        self.register::<M>();
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Resolve `tag` and decode `body` into its registered shape.
    pub fn decode(&self, tag: &str, body: &[u8]) -> Result<Envelope, LinkError> {
        let decode = self
            .decoders
            .get(tag)
            .ok_or_else(|| LinkError::UnknownTag(tag.to_string()))?;
        Ok(Envelope {
            tag: tag.to_string(),
            body: decode(body)?,
        })
    }
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("MessageRegistry").field("tags", &tags).finish()
    }
}

/// A received message whose concrete type is known by tag.
pub struct Envelope {
    tag: String,
    body: Box<dyn Any + Send>,
}

impl Envelope {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is<M: WireMessage>(&self) -> bool {
        self.tag == M::TAG && self.body.is::<M>()
    }

    /// Take the message out as `M`, or get the envelope back.
    pub fn downcast<M: WireMessage>(self) -> Result<M, Envelope> {
        if self.tag != M::TAG {
            return Err(self);
        }
        match self.body.downcast::<M>() {
            Ok(message) => Ok(*message),
            Err(body) => Err(Envelope { tag: self.tag, body }),
        }
    }

    /// Like [`downcast`](Self::downcast) but reports a protocol error.
    pub fn expect<M: WireMessage>(self) -> Result<M, LinkError> {
        self.downcast::<M>().map_err(|other| LinkError::UnexpectedMessage {
            expected: M::TAG,
            got: other.tag,
        })
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope").field("tag", &self.tag).finish_non_exhaustive()
    }
}

/// Serialize `message` into a complete envelope.
pub fn encode_envelope<M: WireMessage>(message: &M) -> Result<BytesMut, LinkError> {
    let tag = M::TAG.as_bytes();
    let tag_len = u16::try_from(tag.len())
        .map_err(|_| LinkError::Malformed(format!("tag '{}' is too long", M::TAG)))?;
    let body = rmp_serde::to_vec(message)?;
    let body_len = u32::try_from(body.len()).map_err(|_| LinkError::MessageTooLarge {
        length: body.len(),
        max: u32::MAX as usize,
    })?;

    let mut buf = BytesMut::with_capacity(2 + tag.len() + 4 + body.len());
    buf.put_u16(tag_len);
    buf.put_slice(tag);
    buf.put_u32(body_len);
    buf.put_slice(&body);
    Ok(buf)
}

/// Typed request/response layer over one [`Channel`].
///
/// One message in flight per direction: concurrent request/response pairs
/// belong on distinct channel ids, not on concurrent writers here.
#[derive(Clone)]
pub struct MessageChannel {
    channel: Channel,
    registry: Arc<MessageRegistry>,
    max_message_size: usize,
}

impl MessageChannel {
    pub fn new(channel: Channel, registry: Arc<MessageRegistry>, max_message_size: usize) -> Self {
        Self {
            channel,
            registry,
            max_message_size,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    /// Queue `message` as one envelope: tag first, then body.
    pub fn send<M: WireMessage>(&self, message: &M) -> Result<(), LinkError> {
        let envelope = encode_envelope(message)?;
        trace!(channel = self.channel.id(), tag = M::TAG, bytes = envelope.len(), "sending message");
        self.channel.write(&envelope)
    }

    /// [`send`](Self::send) and wait until the envelope reached the connection.
    pub async fn send_flushed<M: WireMessage>(&self, message: &M) -> Result<(), LinkError> {
        self.send(message)?;
        self.channel.flush().await
    }

    /// Wait for the next message.
    pub async fn receive(&self) -> Result<Envelope, LinkError> {
        let mut tag_len = [0u8; 2];
        self.channel.read_exact(&mut tag_len).await?;
        let mut tag = vec![0u8; usize::from(u16::from_be_bytes(tag_len))];
        self.channel.read_exact(&mut tag).await?;
        let tag = String::from_utf8(tag)
            .map_err(|_| LinkError::Malformed("message tag is not UTF-8".into()))?;

        let mut body_len = [0u8; 4];
        self.channel.read_exact(&mut body_len).await?;
        let body_len = u32::from_be_bytes(body_len) as usize;
        if body_len > self.max_message_size {
            return Err(LinkError::MessageTooLarge {
                length: body_len,
                max: self.max_message_size,
            });
        }
        let mut body = vec![0u8; body_len];
        self.channel.read_exact(&mut body).await?;

        trace!(channel = self.channel.id(), tag = %tag, bytes = body_len, "received message");
        self.registry.decode(&tag, &body)
    }

    /// Wait for the next message and require it to be an `M`.
    pub async fn receive_as<M: WireMessage>(&self) -> Result<M, LinkError> {
        self.receive().await?.expect::<M>()
    }

    /// Run `handler` for every received message on a dedicated task.
    ///
    /// The task ends cleanly at end-of-stream and with the error on any other
    /// receive failure. A slow handler stalls delivery on this channel.
    pub fn listen<F>(&self, mut handler: F) -> JoinHandle<Result<(), LinkError>>
    where
        F: FnMut(Envelope) + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match this.receive().await {
                    Ok(envelope) => handler(envelope),
                    Err(LinkError::ChannelClosed(_)) => {
                        debug!(channel = this.channel.id(), "message listener reached end of stream");
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                }
            }
        })
    }

    /// Flush and close the underlying channel.
    pub async fn close(&self) -> Result<(), LinkError> {
        self.channel.close().await
    }
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("channel", &self.channel)
            .field("registry", &self.registry)
            .finish()
    }
}

/// `#[serde(with = "taskline_link::message::bin")]` for `Vec<u8>` fields:
/// encodes a MessagePack bin instead of an array of integers.
pub mod bin {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl WireMessage for Ping {
        const TAG: &'static str = "test.ping";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u32,
        note: String,
    }

    impl WireMessage for Pong {
        const TAG: &'static str = "test.pong";
    }

    #[test]
    fn envelope_layout() {
        let buf = encode_envelope(&Ping { seq: 1 }).unwrap();
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]) as usize, "test.ping".len());
        assert_eq!(&buf[2..11], b"test.ping");
        let body_len = u32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]) as usize;
        assert_eq!(buf.len(), 15 + body_len);
    }

    #[test]
    fn registry_resolves_registered_tags_only() {
        let registry = MessageRegistry::new().with::<Ping>();
        assert!(registry.contains("test.ping"));
        assert_eq!(registry.len(), 1);

        let body = rmp_serde::to_vec(&Ping { seq: 9 }).unwrap();
        let envelope = registry.decode("test.ping", &body).unwrap();
        assert!(envelope.is::<Ping>());
        assert!(!envelope.is::<Pong>());
        assert_eq!(envelope.downcast::<Ping>().unwrap(), Ping { seq: 9 });

        assert!(matches!(
            registry.decode("test.pong", &body),
            Err(LinkError::UnknownTag(tag)) if tag == "test.pong"
        ));
    }

    #[test]
    fn expect_reports_the_received_tag() {
        let registry = MessageRegistry::new().with::<Ping>().with::<Pong>();
        let body = rmp_serde::to_vec(&Ping { seq: 2 }).unwrap();
        let err = registry.decode("test.ping", &body).unwrap().expect::<Pong>().unwrap_err();
        match err {
            LinkError::UnexpectedMessage { expected, got } => {
                assert_eq!(expected, "test.pong");
                assert_eq!(got, "test.ping");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn garbage_body_is_a_protocol_violation() {
        let registry = MessageRegistry::new().with::<Pong>();
        let err = registry.decode("test.pong", &[0xc1]).unwrap_err();
        assert!(err.is_protocol_violation());
    }
}
