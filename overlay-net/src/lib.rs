//! TRv1 Overlay Messaging Layer
//!
//! Message-passing core for brokers arranged in a static tree.  Each broker
//! routes topic-addressed envelopes up and down the tree and across a
//! pub/sub event bus.  This crate provides:
//!
//! - **Envelopes**: REQUEST, RESPONSE and EVENT messages with a topic, an
//!   optional JSON-object payload, a route stack and an error number,
//!   encoded with bincode.
//! - **Ports**: the four logical ports a broker talks through, behind the
//!   [`port::Transport`] trait, with an in-process implementation and a
//!   framed TCP carrier.
//! - **RPC**: request/response correlation that preserves envelopes
//!   belonging to other waiters.
//! - **Liveness**: a heartbeat-driven failure detector publishing
//!   `event.live.up.<rank>` / `event.live.down.<rank>`.
//! - **Logging**: structured log records sent to `cmb.log` or redirected
//!   locally.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────────┐
//!  │  Broker (broker.rs)                              │
//!  │  • reads one envelope at a time                  │
//!  │  • dispatches by topic, sends handler output     │
//!  └──────┬───────────────────┬───────────────────────┘
//!         │                   │
//!  ┌──────▼──────┐     ┌──────▼─────┐
//!  │ LiveService │     │ KvsService │
//!  │ (heartbeat) │     │ (kvs.*)    │
//!  └─────────────┘     └────────────┘
//!  ┌──────────────────────────────────────────────────┐
//!  │  Handle: RPC, structured logging, last errnum    │
//!  └──────┬───────────────────────────────────────────┘
//!         │  Transport trait (four logical ports)
//!  ┌──────▼───────────────────────────────────────────┐
//!  │  ChannelTransport (crossbeam) / tcp carrier      │
//!  └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]  | `OverlayConfig` defaults and dev overrides |
//! | [`message`] | Envelope type, bincode codec, framing helpers |
//! | [`payload`] | JSON-object payloads |
//! | [`port`]    | Logical ports, `Transport` trait, channel transport |
//! | [`tcp`]     | Framed TCP listener and send helpers |
//! | [`handle`]  | Per-broker context object |
//! | [`rpc`]     | Request, call and respond |
//! | [`logging`] | Structured log records |
//! | [`live`]    | Liveness state machine |
//! | [`kvs`]     | Key-value request service |
//! | [`broker`]  | Reactor tying services to a transport |
//! | [`error`]   | Crate-wide error enum |

pub mod broker;
pub mod config;
pub mod error;
pub mod handle;
pub mod kvs;
pub mod live;
pub mod logging;
pub mod message;
pub mod payload;
pub mod port;
pub mod rpc;
pub mod tcp;

pub use {
    broker::Broker,
    config::OverlayConfig,
    error::{OverlayError, Result},
    handle::Handle,
    message::{Envelope, MessageType},
    payload::Payload,
    port::{PortKind, RecvMode, Transport},
};
