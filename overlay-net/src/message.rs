//! Message envelope and wire codec.
//!
//! Every unit exchanged on the overlay is an [`Envelope`]: a message type, a
//! topic string, an optional route stack, an optional error number and an
//! optional structured payload.  Envelopes are bincode-encoded; the payload
//! travels as JSON text guarded by [`FLAG_JSON`].
//!
//! Wire invariants enforced in both directions:
//!
//! - REQUEST and EVENT carry a non-empty topic.
//! - Only RESPONSE carries an error number, and a RESPONSE with a nonzero
//!   error number carries no payload.
//! - EVENT carries no route stack; route stacks are bounded in depth.
//! - Payload bytes are present exactly when the JSON flag is set.

use {
    crate::{
        error::{OverlayError, Result},
        payload::Payload,
    },
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// Payload section holds JSON text.
pub const FLAG_JSON: u8 = 0x01;

/// Destination meaning "whichever node serves the topic".
pub const NODEID_ANY: u32 = u32::MAX;

/// Route depth accepted by [`Envelope::decode`].
pub const DEFAULT_MAX_ROUTE_DEPTH: usize = 64;

/// The three kinds of message on the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Request,
    Response,
    Event,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binary layout of an envelope.  The payload is kept as opaque bytes so that
/// flag and payload mismatches can be detected on decode.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    msg_type: MessageType,
    flags: u8,
    topic: Option<String>,
    nodeid: u32,
    route: Option<Vec<String>>,
    errnum: Option<i32>,
    payload: Vec<u8>,
}

/// A typed, topic-addressed message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub topic: Option<String>,
    /// Destination rank for requests, or [`NODEID_ANY`].
    pub nodeid: u32,
    /// Hop identities, oldest first.  `None` when routing is not enabled.
    pub route: Option<Vec<String>>,
    /// Error number; RESPONSE only.  Zero means success.
    pub errnum: Option<i32>,
    pub payload: Option<Payload>,
}

impl Envelope {
    fn new(msg_type: MessageType, topic: Option<String>, payload: Option<Payload>) -> Self {
        Self {
            msg_type,
            topic,
            nodeid: NODEID_ANY,
            route: None,
            errnum: None,
            payload,
        }
    }

    /// A REQUEST for `topic`.
    pub fn request(topic: impl Into<String>, payload: Option<Payload>) -> Self {
        Self::new(MessageType::Request, Some(topic.into()), payload)
    }

    /// An EVENT for `topic`.
    pub fn event(topic: impl Into<String>, payload: Option<Payload>) -> Self {
        Self::new(MessageType::Event, Some(topic.into()), payload)
    }

    /// A RESPONSE to `request`, mirroring its topic, route and destination.
    ///
    /// The payload is discarded when `errnum` is nonzero.
    pub fn response_to(request: &Envelope, errnum: i32, payload: Option<Payload>) -> Self {
        Self {
            msg_type: MessageType::Response,
            topic: request.topic.clone(),
            nodeid: request.nodeid,
            route: request.route.clone(),
            errnum: Some(errnum),
            payload: if errnum == 0 { payload } else { None },
        }
    }

    /// Set the destination rank.
    pub fn with_nodeid(mut self, nodeid: u32) -> Self {
        self.nodeid = nodeid;
        self
    }

    // ── Topic matching ──────────────────────────────────────────────────

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Exact topic match.
    pub fn matches(&self, topic: &str) -> bool {
        self.topic() == Some(topic)
    }

    /// If the topic starts with `prefix`, return the remainder.
    ///
    /// `"live.hello.3"` matched against `"live.hello."` yields `"3"`.
    pub fn match_prefix(&self, prefix: &str) -> Option<&str> {
        self.topic()?.strip_prefix(prefix)
    }

    // ── Route stack ─────────────────────────────────────────────────────

    /// Start an empty route stack so that hops can be recorded.
    pub fn enable_route(&mut self) {
        if self.route.is_none() {
            self.route = Some(Vec::new());
        }
    }

    /// Record a hop.  Enables routing if needed.
    pub fn push_route(&mut self, hop: impl Into<String>) {
        self.route.get_or_insert_with(Vec::new).push(hop.into());
    }

    /// Remove and return the most recent hop.
    pub fn pop_route(&mut self) -> Option<String> {
        self.route.as_mut()?.pop()
    }

    /// Identity of the originating hop.
    pub fn sender(&self) -> Option<&str> {
        self.route.as_ref()?.first().map(String::as_str)
    }

    pub fn route_len(&self) -> usize {
        self.route.as_ref().map_or(0, Vec::len)
    }

    // ── Invariants ──────────────────────────────────────────────────────

    /// Check the wire invariants listed in the module docs.
    pub fn validate(&self, max_route_depth: usize) -> Result<()> {
        let needs_topic = matches!(self.msg_type, MessageType::Request | MessageType::Event);
        if needs_topic && self.topic().is_none_or(str::is_empty) {
            return Err(OverlayError::Protocol(format!(
                "{} without a topic",
                self.msg_type
            )));
        }
        match (self.msg_type, self.errnum) {
            (MessageType::Response, Some(errnum)) if errnum != 0 && self.payload.is_some() => {
                return Err(OverlayError::Protocol(format!(
                    "error response (errnum {errnum}) carries a payload"
                )));
            }
            (MessageType::Request | MessageType::Event, Some(_)) => {
                return Err(OverlayError::Protocol(format!(
                    "{} carries an error number",
                    self.msg_type
                )));
            }
            _ => {}
        }
        if self.msg_type == MessageType::Event && self.route.is_some() {
            return Err(OverlayError::Protocol("event carries a route stack".into()));
        }
        if self.route_len() > max_route_depth {
            return Err(OverlayError::Protocol(format!(
                "route depth {} exceeds {}",
                self.route_len(),
                max_route_depth
            )));
        }
        Ok(())
    }

    // ── Serialisation ───────────────────────────────────────────────────

    /// Encode to wire bytes.
    ///
    /// An absent payload produces no payload section at all; an empty
    /// object produces `{}` with the JSON flag set.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate(usize::MAX)?;
        let (flags, payload) = match &self.payload {
            Some(p) => (FLAG_JSON, p.to_bytes()?),
            None => (0, Vec::new()),
        };
        let wire = WireEnvelope {
            msg_type: self.msg_type,
            flags,
            topic: self.topic.clone(),
            nodeid: self.nodeid,
            route: self.route.clone(),
            errnum: self.errnum,
            payload,
        };
        bincode::serialize(&wire).map_err(OverlayError::Serialization)
    }

    /// Decode wire bytes, with the default route depth limit.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::decode_with_limit(data, DEFAULT_MAX_ROUTE_DEPTH)
    }

    /// Decode wire bytes.  Every failure is reported as
    /// [`OverlayError::Protocol`].
    pub fn decode_with_limit(data: &[u8], max_route_depth: usize) -> Result<Self> {
        let wire: WireEnvelope = bincode::deserialize(data)
            .map_err(|e| OverlayError::Protocol(format!("undecodable envelope: {e}")))?;

        let has_json = wire.flags & FLAG_JSON != 0;
        let payload = match (has_json, wire.payload.is_empty()) {
            (false, true) => None,
            (true, false) => Some(Payload::from_bytes(&wire.payload)?),
            (false, false) => {
                return Err(OverlayError::Protocol(
                    "payload present without JSON flag".into(),
                ))
            }
            (true, true) => {
                return Err(OverlayError::Protocol("JSON flag set on empty payload".into()))
            }
        };

        let envelope = Self {
            msg_type: wire.msg_type,
            topic: wire.topic,
            nodeid: wire.nodeid,
            route: wire.route,
            errnum: wire.errnum,
            payload,
        };
        envelope.validate(max_route_depth)?;
        Ok(envelope)
    }

    /// Encode with a 4-byte little-endian length prefix.
    ///
    /// Wire format: `[len: u32-le][envelope: len bytes]`
    pub fn encode_framed(&self, max_size: usize) -> Result<Vec<u8>> {
        let body = self.encode()?;
        if body.len() > max_size {
            return Err(OverlayError::MessageTooLarge {
                size: body.len(),
                max: max_size,
            });
        }
        let len = u32::try_from(body.len()).map_err(|_| OverlayError::MessageTooLarge {
            size: body.len(),
            max: u32::MAX as usize,
        })?;
        let mut buf = Vec::with_capacity(4usize.saturating_add(body.len()));
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Read the length prefix from a 4-byte buffer.
    pub fn read_frame_len(header: &[u8; 4]) -> usize {
        u32::from_le_bytes(*header) as usize
    }

    /// Return a human-readable tag for logging.
    pub fn kind(&self) -> &'static str {
        self.msg_type.as_str()
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.topic().unwrap_or("<none>"))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
