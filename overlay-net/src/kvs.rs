//! Key-value request service.
//!
//! Clients write with `kvs.put`, which only queues the pair on a
//! per-client record, and make their writes visible with `kvs.commit`,
//! which flushes the queue to the store in put order and reports how many
//! writes were attempted and how many failed.  `kvs.get` reads straight
//! from the store.  `kvs.disconnect` forgets a client and anything it left
//! queued.  Clients are identified by the originating hop of the request's
//! route stack.
//!
//! The store itself sits behind [`KvStore`]; [`MemoryStore`] keeps
//! everything in a map.

use {
    crate::{
        error::{OverlayError, Result},
        message::{Envelope, MessageType},
        payload::Payload,
        port::{Outbound, PortKind},
    },
    log::{debug, warn},
    std::collections::HashMap,
};

pub const KVS_PREFIX: &str = "kvs.";
pub const PUT_TOPIC: &str = "kvs.put";
pub const GET_TOPIC: &str = "kvs.get";
pub const COMMIT_TOPIC: &str = "kvs.commit";
pub const DISCONNECT_TOPIC: &str = "kvs.disconnect";

/// Backing store for the key-value service.
pub trait KvStore {
    /// Value stored under `key`, or `None` if there is none.
    fn get(&mut self, key: &str) -> Result<Option<String>>;

    /// Store `val` under `key`.
    fn set(&mut self, key: &str, val: &str) -> Result<()>;
}

/// A [`KvStore`] held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, val: &str) -> Result<()> {
        self.entries.insert(key.to_string(), val.to_string());
        Ok(())
    }
}

/// Writes queued by one client, and counters since its last commit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KvsClient {
    pub put_queue: Vec<(String, String)>,
    pub putcount: u64,
    pub errcount: u64,
}

/// The `kvs.*` request handler.
#[derive(Debug)]
pub struct KvsService<S: KvStore> {
    store: S,
    clients: HashMap<String, KvsClient>,
}

impl<S: KvStore> KvsService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clients: HashMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn client(&self, sender: &str) -> Option<&KvsClient> {
        self.clients.get(sender)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Handle `envelope` if it is a `kvs.*` request.
    ///
    /// Returns `None` for topics this service does not own.  Protocol
    /// errors are logged and the request is dropped without a reply.
    pub fn handle(&mut self, envelope: &Envelope) -> Option<Vec<Outbound>> {
        envelope.match_prefix(KVS_PREFIX)?;
        if envelope.msg_type != MessageType::Request {
            debug!("ignoring {}: not a request", envelope);
            return Some(Vec::new());
        }
        let result = if envelope.matches(PUT_TOPIC) {
            self.put(envelope).map(|()| None)
        } else if envelope.matches(GET_TOPIC) {
            self.get(envelope).map(Some)
        } else if envelope.matches(COMMIT_TOPIC) {
            self.commit(envelope).map(Some)
        } else if envelope.matches(DISCONNECT_TOPIC) {
            self.disconnect(envelope).map(|()| None)
        } else {
            return None;
        };
        match result {
            Ok(reply) => Some(
                reply
                    .map(|payload| Outbound {
                        port: PortKind::DownstreamRequest,
                        envelope: Envelope::response_to(envelope, 0, Some(payload)),
                    })
                    .into_iter()
                    .collect(),
            ),
            Err(e) => {
                warn!("{}: {}", envelope, e);
                Some(Vec::new())
            }
        }
    }

    fn put(&mut self, envelope: &Envelope) -> Result<()> {
        let (sender, payload) = sender_and_payload(envelope)?;
        let (Some(key), Some(val)) = (payload.get("key"), payload.get("val")) else {
            return Err(OverlayError::Protocol("put needs key and val".into()));
        };
        let entry = (value_string(key), value_string(val));
        self.clients
            .entry(sender.to_string())
            .or_default()
            .put_queue
            .push(entry);
        Ok(())
    }

    fn get(&mut self, envelope: &Envelope) -> Result<Payload> {
        let payload = envelope
            .payload
            .as_ref()
            .ok_or_else(|| OverlayError::Protocol("get without payload".into()))?;
        let key = payload
            .get("key")
            .map(value_string)
            .ok_or_else(|| OverlayError::Protocol("get needs key".into()))?;
        let mut reply = payload.clone();
        match self.store.get(&key) {
            Ok(Some(val)) => {
                reply.insert("val", val);
            }
            Ok(None) => {}
            Err(e) => warn!("get {}: {}", key, e),
        }
        Ok(reply)
    }

    fn commit(&mut self, envelope: &Envelope) -> Result<Payload> {
        let (sender, payload) = sender_and_payload(envelope)?;
        let mut reply = payload.clone();
        let (errcount, putcount) = match self.clients.get_mut(sender) {
            Some(client) => {
                for (key, val) in client.put_queue.drain(..) {
                    client.putcount = client.putcount.saturating_add(1);
                    if let Err(e) = self.store.set(&key, &val) {
                        debug!("set {}: {}", key, e);
                        client.errcount = client.errcount.saturating_add(1);
                    }
                }
                let counts = (client.errcount, client.putcount);
                client.errcount = 0;
                client.putcount = 0;
                counts
            }
            None => (0, 0),
        };
        reply.insert("errcount", errcount);
        reply.insert("putcount", putcount);
        Ok(reply)
    }

    fn disconnect(&mut self, envelope: &Envelope) -> Result<()> {
        let sender = envelope
            .sender()
            .ok_or_else(|| OverlayError::Protocol("disconnect without sender".into()))?;
        if self.clients.remove(sender).is_some() {
            debug!("client {} disconnected", sender);
        }
        Ok(())
    }
}

fn sender_and_payload(envelope: &Envelope) -> Result<(&str, &Payload)> {
    let payload = envelope
        .payload
        .as_ref()
        .ok_or_else(|| OverlayError::Protocol("request without payload".into()))?;
    let sender = envelope
        .sender()
        .ok_or_else(|| OverlayError::Protocol("request without sender".into()))?;
    Ok((sender, payload))
}

/// String form of a JSON value: strings as-is, everything else as JSON.
fn value_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
