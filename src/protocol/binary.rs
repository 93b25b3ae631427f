//! Binary batch frame codec.
//!
//! The push-server binary protocol wraps every frame in a batch envelope:
//!
//! | Direction | Envelope | Members |
//! |-----------|----------|---------|
//! | Client → Server | [`RequestBatch`] | incoming messages, channel stats request, server stats request |
//! | Server → Client | [`ResponseBatch`] | outgoing messages, channel stats, server stats (JSON) |
//!
//! Ids are raw bytes on the wire and base64 text everywhere else
//! (see [`encode_id`] / [`decode_id`]).
//!
//! Encoding is canonical: fields are written in tag order and proto3 default
//! values are omitted, so `encode(decode(frame)) == frame` for every frame
//! produced here.

// ============================================================================
// Imports
// ============================================================================

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::message::{EventBody, PushMessage, SenderInfo, SenderType};
use super::wire::{
    FieldReader, put_bool, put_bytes, put_fixed32, put_message, put_string, put_uint32,
};

// ============================================================================
// Id Helpers
// ============================================================================

/// Encodes raw id bytes as base64 text.
#[inline]
#[must_use]
pub fn encode_id(id: &[u8]) -> String {
    STANDARD.encode(id)
}

/// Decodes base64 id text into raw bytes.
///
/// # Errors
///
/// Returns [`Error::Base64`] if the text is not valid base64.
#[inline]
pub fn decode_id(id: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(id)?)
}

// ============================================================================
// Receiver
// ============================================================================

/// Addressee of an incoming (client-published) message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Receiver {
    /// Channel id bytes.
    pub id: Vec<u8>,
    /// Whether `id` is a private channel id.
    pub is_private: bool,
    /// Channel signature bytes.
    pub signature: Vec<u8>,
}

impl Receiver {
    fn encode_into(&self, buf: &mut BytesMut) {
        put_bytes(buf, 1, &self.id);
        put_bool(buf, 2, self.is_private);
        put_bytes(buf, 3, &self.signature);
    }

    fn decode(data: Bytes) -> Result<Self> {
        let mut receiver = Self::default();
        let mut reader = FieldReader::new(data);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => receiver.id = value.into_bytes()?.to_vec(),
                2 => receiver.is_private = value.as_bool()?,
                3 => receiver.signature = value.into_bytes()?.to_vec(),
                _ => {}
            }
        }
        Ok(receiver)
    }
}

// ============================================================================
// Sender
// ============================================================================

/// Publisher of a message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sender {
    /// Sender type.
    pub kind: SenderType,
    /// Sender id bytes.
    pub id: Vec<u8>,
}

impl Sender {
    fn encode_into(&self, buf: &mut BytesMut) {
        put_uint32(buf, 1, u32::from(self.kind));
        put_bytes(buf, 2, &self.id);
    }

    fn decode(data: Bytes) -> Result<Self> {
        let mut sender = Self::default();
        let mut reader = FieldReader::new(data);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => sender.kind = SenderType::from(value.as_u32()?),
                2 => sender.id = value.into_bytes()?.to_vec(),
                _ => {}
            }
        }
        Ok(sender)
    }

    /// Converts to the JSON-facing descriptor placed in `extra.sender`.
    #[must_use]
    pub fn to_info(&self) -> SenderInfo {
        SenderInfo {
            kind: self.kind,
            id: (!self.id.is_empty()).then(|| encode_id(&self.id)),
        }
    }
}

// ============================================================================
// IncomingMessage
// ============================================================================

/// A message published by this client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IncomingMessage {
    /// Addressees.
    pub receivers: Vec<Receiver>,
    /// Optional sender descriptor.
    pub sender: Option<Sender>,
    /// JSON-encoded [`EventBody`].
    pub body: String,
    /// Seconds until the server drops the message (0 = never).
    pub expiry: u32,
    /// Message type tag.
    pub kind: String,
}

impl IncomingMessage {
    fn encode_into(&self, buf: &mut BytesMut) {
        for receiver in &self.receivers {
            put_message(buf, 1, |inner| receiver.encode_into(inner));
        }
        if let Some(sender) = &self.sender {
            put_message(buf, 2, |inner| sender.encode_into(inner));
        }
        put_string(buf, 3, &self.body);
        put_uint32(buf, 4, self.expiry);
        put_string(buf, 5, &self.kind);
    }

    /// Encodes this message alone.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    /// Decodes a single message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] on malformed input.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::decode_bytes(Bytes::copy_from_slice(data))
    }

    fn decode_bytes(data: Bytes) -> Result<Self> {
        let mut message = Self::default();
        let mut reader = FieldReader::new(data);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => message.receivers.push(Receiver::decode(value.into_bytes()?)?),
                2 => message.sender = Some(Sender::decode(value.into_bytes()?)?),
                3 => message.body = value.into_string()?,
                4 => message.expiry = value.as_u32()?,
                5 => message.kind = value.into_string()?,
                _ => {}
            }
        }
        Ok(message)
    }
}

// ============================================================================
// OutgoingMessage
// ============================================================================

/// A message delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutgoingMessage {
    /// Message id bytes.
    pub id: Vec<u8>,
    /// JSON-encoded [`EventBody`].
    pub body: String,
    /// Expiry in seconds (0 = never).
    pub expiry: u32,
    /// Creation time, unix seconds.
    pub created: u32,
    /// Optional sender descriptor.
    pub sender: Option<Sender>,
}

impl OutgoingMessage {
    fn encode_into(&self, buf: &mut BytesMut) {
        put_bytes(buf, 1, &self.id);
        put_string(buf, 2, &self.body);
        put_uint32(buf, 3, self.expiry);
        put_fixed32(buf, 4, self.created);
        if let Some(sender) = &self.sender {
            put_message(buf, 5, |inner| sender.encode_into(inner));
        }
    }

    /// Encodes this message alone.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    /// Decodes a single message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] on malformed input.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::decode_bytes(Bytes::copy_from_slice(data))
    }

    fn decode_bytes(data: Bytes) -> Result<Self> {
        let mut message = Self::default();
        let mut reader = FieldReader::new(data);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => message.id = value.into_bytes()?.to_vec(),
                2 => message.body = value.into_string()?,
                3 => message.expiry = value.as_u32()?,
                4 => message.created = value.as_u32()?,
                5 => message.sender = Some(Sender::decode(value.into_bytes()?)?),
                _ => {}
            }
        }
        Ok(message)
    }

    /// Converts into a [`PushMessage`], parsing the JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the body is not a valid event body.
    pub fn to_push_message(&self) -> Result<PushMessage> {
        let mut body: EventBody = serde_json::from_str(&self.body)?;
        if let Some(sender) = &self.sender {
            body.extra.sender = Some(sender.to_info());
        }
        if self.created > 0 && body.extra.server_time_unix.is_none() {
            body.extra.server_time_unix = Some(f64::from(self.created));
        }
        Ok(PushMessage {
            mid: (!self.id.is_empty()).then(|| encode_id(&self.id)),
            tag: None,
            time: None,
            body,
        })
    }
}

// ============================================================================
// Channel Stats
// ============================================================================

/// Channel addressed by a stats request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelId {
    /// Channel id bytes.
    pub id: Vec<u8>,
    /// Whether `id` is private.
    pub is_private: bool,
    /// Channel signature bytes.
    pub signature: Vec<u8>,
}

impl ChannelId {
    fn encode_into(&self, buf: &mut BytesMut) {
        put_bytes(buf, 1, &self.id);
        put_bool(buf, 2, self.is_private);
        put_bytes(buf, 3, &self.signature);
    }

    fn decode(data: Bytes) -> Result<Self> {
        let mut channel = Self::default();
        let mut reader = FieldReader::new(data);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => channel.id = value.into_bytes()?.to_vec(),
                2 => channel.is_private = value.as_bool()?,
                3 => channel.signature = value.into_bytes()?.to_vec(),
                _ => {}
            }
        }
        Ok(channel)
    }
}

/// Presence of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelStats {
    /// Channel id bytes.
    pub id: Vec<u8>,
    /// Whether `id` is private.
    pub is_private: bool,
    /// Whether a subscriber is connected.
    pub is_online: bool,
}

impl ChannelStats {
    fn encode_into(&self, buf: &mut BytesMut) {
        put_bytes(buf, 1, &self.id);
        put_bool(buf, 2, self.is_private);
        put_bool(buf, 3, self.is_online);
    }

    fn decode(data: Bytes) -> Result<Self> {
        let mut stats = Self::default();
        let mut reader = FieldReader::new(data);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => stats.id = value.into_bytes()?.to_vec(),
                2 => stats.is_private = value.as_bool()?,
                3 => stats.is_online = value.as_bool()?,
                _ => {}
            }
        }
        Ok(stats)
    }
}

// ============================================================================
// Request / RequestBatch
// ============================================================================

/// One command of a [`RequestBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Publish messages.
    IncomingMessages(Vec<IncomingMessage>),
    /// Ask for channel presence.
    ChannelStats(Vec<ChannelId>),
    /// Ask for server statistics.
    ServerStats,
}

impl Request {
    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Self::IncomingMessages(messages) => put_message(buf, 1, |inner| {
                for message in messages {
                    put_message(inner, 1, |m| message.encode_into(m));
                }
            }),
            Self::ChannelStats(channels) => put_message(buf, 2, |inner| {
                for channel in channels {
                    put_message(inner, 1, |c| channel.encode_into(c));
                }
            }),
            Self::ServerStats => put_message(buf, 3, |_| {}),
        }
    }

    fn decode(data: Bytes) -> Result<Option<Self>> {
        let mut request = None;
        let mut reader = FieldReader::new(data);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => {
                    let mut messages = Vec::new();
                    let mut inner = FieldReader::new(value.into_bytes()?);
                    while let Some((f, v)) = inner.next_field()? {
                        if f == 1 {
                            messages.push(IncomingMessage::decode_bytes(v.into_bytes()?)?);
                        }
                    }
                    request = Some(Self::IncomingMessages(messages));
                }
                2 => {
                    let mut channels = Vec::new();
                    let mut inner = FieldReader::new(value.into_bytes()?);
                    while let Some((f, v)) = inner.next_field()? {
                        if f == 1 {
                            channels.push(ChannelId::decode(v.into_bytes()?)?);
                        }
                    }
                    request = Some(Self::ChannelStats(channels));
                }
                3 => {
                    value.into_bytes()?;
                    request = Some(Self::ServerStats);
                }
                _ => {}
            }
        }
        Ok(request)
    }
}

/// Client → server envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestBatch {
    /// Commands in order.
    pub requests: Vec<Request>,
}

impl RequestBatch {
    /// Creates a batch publishing `messages`.
    #[must_use]
    pub fn publish(messages: Vec<IncomingMessage>) -> Self {
        Self {
            requests: vec![Request::IncomingMessages(messages)],
        }
    }

    /// Encodes the batch.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for request in &self.requests {
            put_message(&mut buf, 1, |inner| request.encode_into(inner));
        }
        buf.to_vec()
    }

    /// Decodes a batch. Requests with no known command are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] on malformed input.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut batch = Self::default();
        let mut reader = FieldReader::new(Bytes::copy_from_slice(data));
        while let Some((field, value)) = reader.next_field()? {
            if field == 1
                && let Some(request) = Request::decode(value.into_bytes()?)?
            {
                batch.requests.push(request);
            }
        }
        Ok(batch)
    }
}

// ============================================================================
// Response / ResponseBatch
// ============================================================================

/// One command of a [`ResponseBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Delivered messages.
    OutgoingMessages(Vec<OutgoingMessage>),
    /// Channel presence.
    ChannelStats(Vec<ChannelStats>),
    /// Server statistics as JSON text.
    ServerStats(String),
}

impl Response {
    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Self::OutgoingMessages(messages) => put_message(buf, 1, |inner| {
                for message in messages {
                    put_message(inner, 1, |m| message.encode_into(m));
                }
            }),
            Self::ChannelStats(channels) => put_message(buf, 2, |inner| {
                for channel in channels {
                    put_message(inner, 1, |c| channel.encode_into(c));
                }
            }),
            Self::ServerStats(json) => put_message(buf, 3, |inner| put_string(inner, 1, json)),
        }
    }

    fn decode(data: Bytes) -> Result<Option<Self>> {
        let mut response = None;
        let mut reader = FieldReader::new(data);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => {
                    let mut messages = Vec::new();
                    let mut inner = FieldReader::new(value.into_bytes()?);
                    while let Some((f, v)) = inner.next_field()? {
                        if f == 1 {
                            messages.push(OutgoingMessage::decode_bytes(v.into_bytes()?)?);
                        }
                    }
                    response = Some(Self::OutgoingMessages(messages));
                }
                2 => {
                    let mut channels = Vec::new();
                    let mut inner = FieldReader::new(value.into_bytes()?);
                    while let Some((f, v)) = inner.next_field()? {
                        if f == 1 {
                            channels.push(ChannelStats::decode(v.into_bytes()?)?);
                        }
                    }
                    response = Some(Self::ChannelStats(channels));
                }
                3 => {
                    let mut json = String::new();
                    let mut inner = FieldReader::new(value.into_bytes()?);
                    while let Some((f, v)) = inner.next_field()? {
                        if f == 1 {
                            json = v.into_string()?;
                        }
                    }
                    response = Some(Self::ServerStats(json));
                }
                _ => {}
            }
        }
        Ok(response)
    }
}

/// Server → client envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseBatch {
    /// Commands in order.
    pub responses: Vec<Response>,
}

impl ResponseBatch {
    /// Encodes the batch.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for response in &self.responses {
            put_message(&mut buf, 1, |inner| response.encode_into(inner));
        }
        buf.to_vec()
    }

    /// Decodes a batch. Responses with no known command are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] on malformed input.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut batch = Self::default();
        let mut reader = FieldReader::new(Bytes::copy_from_slice(data));
        while let Some((field, value)) = reader.next_field()? {
            if field == 1
                && let Some(response) = Response::decode(value.into_bytes()?)?
            {
                batch.responses.push(response);
            }
        }
        Ok(batch)
    }

    /// Extracts delivered messages in batch order.
    ///
    /// A message whose body is not valid JSON is logged and skipped;
    /// its siblings are kept.
    #[must_use]
    pub fn push_messages(&self) -> Vec<PushMessage> {
        let mut result = Vec::new();
        for response in &self.responses {
            match response {
                Response::OutgoingMessages(messages) => {
                    for message in messages {
                        match message.to_push_message() {
                            Ok(push) => result.push(push),
                            Err(e) => {
                                warn!(error = %e, id = %encode_id(&message.id), "Skipping message with malformed body");
                            }
                        }
                    }
                }
                Response::ChannelStats(channels) => {
                    debug!(count = channels.len(), "Ignoring channel stats response");
                }
                Response::ServerStats(_) => {
                    debug!("Ignoring server stats response");
                }
            }
        }
        result
    }
}

/// Decodes a binary frame straight into push messages.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the envelope itself is malformed.
pub fn decode_push_messages(data: &[u8]) -> Result<Vec<PushMessage>> {
    Ok(ResponseBatch::decode(data)?.push_messages())
}

/// Rejects empty ids early; the server ignores receivers without one.
pub(crate) fn require_id(id: &[u8], what: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::protocol(format!("{what} id is empty")));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
