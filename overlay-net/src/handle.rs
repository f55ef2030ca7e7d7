//! Per-broker messaging handle.
//!
//! A [`Handle`] bundles the transport with the small amount of process-wide
//! state that the RPC layer and the logging facade share: this broker's
//! rank, the hop identity it stamps on outgoing requests, the structured
//! logging context and the last recorded error number.  It is created once
//! per broker and passed explicitly to whatever needs it.

use {
    crate::{
        error::{OverlayError, Result},
        logging::LogContext,
        message::Envelope,
        port::{PortKind, RecvMode, Transport},
    },
    log::debug,
};

#[derive(Debug)]
pub struct Handle<T: Transport> {
    pub(crate) transport: T,
    rank: u32,
    identity: String,
    pub(crate) log: LogContext,
    last_errnum: Option<i32>,
}

impl<T: Transport> Handle<T> {
    /// Create a handle for the broker at `rank`.
    ///
    /// `identity` is pushed onto the route stack of every request this
    /// handle sends, and is what services see as the request's sender.
    pub fn new(transport: T, rank: u32, identity: impl Into<String>) -> Self {
        Self {
            transport,
            rank,
            identity: identity.into(),
            log: LogContext::default(),
            last_errnum: None,
        }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Send an envelope on `port`.
    pub fn send(&mut self, port: PortKind, envelope: &Envelope) -> Result<()> {
        self.transport.send(port, envelope)
    }

    /// Receive from `port`.
    pub fn recv(&mut self, port: PortKind, mode: RecvMode) -> Result<Envelope> {
        self.transport.recv(port, mode)
    }

    /// Error number of the most recent failed operation, if any.
    pub fn last_errnum(&self) -> Option<i32> {
        self.last_errnum
    }

    /// Remember `err` for a later [`Handle::log_error`].
    pub(crate) fn record_error(&mut self, err: &OverlayError) {
        let errnum = err.errnum();
        debug!("recording errnum {} ({})", errnum, err);
        self.last_errnum = Some(errnum);
    }

    /// Pass a result through, recording the error number if it failed.
    pub(crate) fn track<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }
}
