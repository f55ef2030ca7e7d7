//! Logical transport ports.
//!
//! A broker talks to the rest of the overlay through four logical ports:
//!
//! | Port | Direction | Carries |
//! |------|-----------|---------|
//! | [`PortKind::UpstreamRequest`]   | to parent   | requests heading up the tree |
//! | [`PortKind::DownstreamRequest`] | both        | requests from children, and responses |
//! | [`PortKind::EventIn`]           | inbound     | published events, prefix filtered |
//! | [`PortKind::EventOut`]          | outbound    | events this broker publishes |
//!
//! [`Transport`] is the seam the rest of the crate is written against.
//! [`ChannelTransport`] implements it in-process on crossbeam channels; the
//! matching [`TransportPeer`] holds the far end of every port and stands in
//! for the routing fabric.  Envelopes cross the channels as encoded bytes so
//! the codec runs on every hop.

use {
    crate::{
        config::OverlayConfig,
        error::{OverlayError, Result},
        message::Envelope,
    },
    crossbeam_channel::{
        bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError,
    },
    log::{debug, warn},
    std::{collections::VecDeque, fmt, time::Duration},
};

/// One of the four logical ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    UpstreamRequest,
    DownstreamRequest,
    EventIn,
    EventOut,
}

impl PortKind {
    pub const ALL: [PortKind; 4] = [
        PortKind::UpstreamRequest,
        PortKind::DownstreamRequest,
        PortKind::EventIn,
        PortKind::EventOut,
    ];

    fn index(self) -> usize {
        match self {
            Self::UpstreamRequest => 0,
            Self::DownstreamRequest => 1,
            Self::EventIn => 2,
            Self::EventOut => 3,
        }
    }

    /// Whether envelopes can be received on this port.
    pub fn can_recv(self) -> bool {
        self != Self::EventOut
    }

    /// Whether envelopes can be sent on this port.
    pub fn can_send(self) -> bool {
        self != Self::EventIn
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UpstreamRequest => "upstream-request",
            Self::DownstreamRequest => "downstream-request",
            Self::EventIn => "event-in",
            Self::EventOut => "event-out",
        })
    }
}

/// An envelope to be sent, and where.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub port: PortKind,
    pub envelope: Envelope,
}

/// How [`Transport::recv`] behaves on an empty port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    /// Wait until an envelope arrives or the port closes.
    Blocking,
    /// Return [`OverlayError::WouldBlock`] immediately.
    NonBlocking,
}

/// Send/receive primitives over the four logical ports.
///
/// Sends are fire-and-forget and never block: a port with no room fails
/// with [`OverlayError::PortFull`].  Per-peer ordering on a port is
/// preserved; nothing is promised across ports.
pub trait Transport {
    /// Send an envelope on `port`.
    fn send(&mut self, port: PortKind, envelope: &Envelope) -> Result<()>;

    /// Receive the next envelope from `port`.
    ///
    /// Malformed input is logged and skipped, never returned.
    fn recv(&mut self, port: PortKind, mode: RecvMode) -> Result<Envelope>;

    /// Give an already received envelope back to `port`.
    ///
    /// The envelope is returned by the next `recv` on that port, ahead of
    /// anything requeued earlier or still in flight.  Callers handing back
    /// several envelopes requeue them newest first.
    fn requeue(&mut self, port: PortKind, envelope: Envelope) -> Result<()>;

    /// Accept events whose topic starts with `prefix` on the event-in port.
    fn subscribe(&mut self, prefix: &str) -> Result<()>;

    /// Drop a subscription added with [`Transport::subscribe`].
    fn unsubscribe(&mut self, prefix: &str) -> Result<()>;
}

fn subscribed(subscriptions: &[String], envelope: &Envelope) -> bool {
    envelope
        .topic()
        .is_some_and(|topic| subscriptions.iter().any(|s| topic.starts_with(s.as_str())))
}

/// Local end of one port.
#[derive(Debug)]
struct PortChannels {
    outbound: Sender<Vec<u8>>,
    inbound: Receiver<Vec<u8>>,
    requeued: VecDeque<Envelope>,
}

/// In-process [`Transport`] backed by crossbeam channels.
#[derive(Debug)]
pub struct ChannelTransport {
    ports: Vec<PortChannels>,
    subscriptions: Vec<String>,
    max_message_size: usize,
    max_route_depth: usize,
}

/// The far end of a [`ChannelTransport`].
///
/// `deliver` injects envelopes as if they arrived from the overlay;
/// `try_recv_sent` / `recv_sent` observe what the broker sent.
#[derive(Debug, Clone)]
pub struct TransportPeer {
    inbound: Vec<Sender<Vec<u8>>>,
    outbound: Vec<Receiver<Vec<u8>>>,
}

impl ChannelTransport {
    /// Create a transport and the peer connected to it.
    pub fn new(config: &OverlayConfig) -> (Self, TransportPeer) {
        let capacity = config.channel_buffer_size;
        let mut ports = Vec::with_capacity(PortKind::ALL.len());
        let mut peer = TransportPeer {
            inbound: Vec::with_capacity(PortKind::ALL.len()),
            outbound: Vec::with_capacity(PortKind::ALL.len()),
        };
        for _ in PortKind::ALL {
            let (out_tx, out_rx) = bounded(capacity);
            let (in_tx, in_rx) = bounded(capacity);
            ports.push(PortChannels {
                outbound: out_tx,
                inbound: in_rx,
                requeued: VecDeque::new(),
            });
            peer.inbound.push(in_tx);
            peer.outbound.push(out_rx);
        }
        let transport = Self {
            ports,
            subscriptions: Vec::new(),
            max_message_size: config.max_message_size,
            max_route_depth: config.max_route_depth,
        };
        (transport, peer)
    }

    /// Current event subscriptions.
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, port: PortKind, envelope: &Envelope) -> Result<()> {
        if !port.can_send() {
            return Err(OverlayError::InvalidArgument(format!(
                "cannot send on {port} port"
            )));
        }
        let bytes = envelope.encode()?;
        if bytes.len() > self.max_message_size {
            return Err(OverlayError::MessageTooLarge {
                size: bytes.len(),
                max: self.max_message_size,
            });
        }
        self.ports[port.index()]
            .outbound
            .try_send(bytes)
            .map_err(|e| match e {
                TrySendError::Full(_) => OverlayError::PortFull(port),
                TrySendError::Disconnected(_) => OverlayError::PortClosed(port),
            })?;
        debug!("sent {} on {} port", envelope, port);
        Ok(())
    }

    fn recv(&mut self, port: PortKind, mode: RecvMode) -> Result<Envelope> {
        if !port.can_recv() {
            return Err(OverlayError::InvalidArgument(format!(
                "cannot receive on {port} port"
            )));
        }
        let channels = &mut self.ports[port.index()];
        if let Some(envelope) = channels.requeued.pop_front() {
            return Ok(envelope);
        }
        loop {
            let bytes = match mode {
                RecvMode::Blocking => channels
                    .inbound
                    .recv()
                    .map_err(|_| OverlayError::PortClosed(port))?,
                RecvMode::NonBlocking => match channels.inbound.try_recv() {
                    Ok(bytes) => bytes,
                    Err(TryRecvError::Empty) => return Err(OverlayError::WouldBlock),
                    Err(TryRecvError::Disconnected) => {
                        return Err(OverlayError::PortClosed(port))
                    }
                },
            };
            let envelope = match Envelope::decode_with_limit(&bytes, self.max_route_depth) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("dropping malformed envelope on {} port: {}", port, e);
                    continue;
                }
            };
            if port == PortKind::EventIn && !subscribed(&self.subscriptions, &envelope) {
                debug!("filtered unsubscribed {}", envelope);
                continue;
            }
            return Ok(envelope);
        }
    }

    fn requeue(&mut self, port: PortKind, envelope: Envelope) -> Result<()> {
        if !port.can_recv() {
            return Err(OverlayError::InvalidArgument(format!(
                "cannot requeue on {port} port"
            )));
        }
        self.ports[port.index()].requeued.push_front(envelope);
        Ok(())
    }

    fn subscribe(&mut self, prefix: &str) -> Result<()> {
        if !self.subscriptions.iter().any(|s| s == prefix) {
            self.subscriptions.push(prefix.to_string());
        }
        Ok(())
    }

    fn unsubscribe(&mut self, prefix: &str) -> Result<()> {
        self.subscriptions.retain(|s| s != prefix);
        Ok(())
    }
}

impl TransportPeer {
    /// Inject an envelope into `port` of the connected transport.
    pub fn deliver(&self, port: PortKind, envelope: &Envelope) -> Result<()> {
        self.deliver_raw(port, envelope.encode()?)
    }

    /// Inject raw bytes, bypassing the encoder.
    pub fn deliver_raw(&self, port: PortKind, bytes: Vec<u8>) -> Result<()> {
        self.inbound[port.index()]
            .send(bytes)
            .map_err(|_| OverlayError::PortClosed(port))
    }

    /// Take the next envelope the transport sent on `port`, if any.
    pub fn try_recv_sent(&self, port: PortKind) -> Result<Envelope> {
        match self.outbound[port.index()].try_recv() {
            Ok(bytes) => Envelope::decode(&bytes),
            Err(TryRecvError::Empty) => Err(OverlayError::WouldBlock),
            Err(TryRecvError::Disconnected) => Err(OverlayError::PortClosed(port)),
        }
    }

    /// Wait up to `timeout` for the next envelope sent on `port`.
    pub fn recv_sent(&self, port: PortKind, timeout: Duration) -> Result<Envelope> {
        match self.outbound[port.index()].recv_timeout(timeout) {
            Ok(bytes) => Envelope::decode(&bytes),
            Err(RecvTimeoutError::Timeout) => Err(OverlayError::Transport(
                std::io::Error::new(std::io::ErrorKind::TimedOut, "no envelope sent"),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(OverlayError::PortClosed(port)),
        }
    }

    /// Take everything sent on `port` so far.
    pub fn drain_sent(&self, port: PortKind) -> Vec<Envelope> {
        self.outbound[port.index()]
            .try_iter()
            .filter_map(|bytes| Envelope::decode(&bytes).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::payload::Payload, assert_matches::assert_matches};

    fn transport() -> (ChannelTransport, TransportPeer) {
        ChannelTransport::new(&OverlayConfig::dev_default(0, 4))
    }

    #[test]
    fn test_nonblocking_recv_on_empty_port() {
        let (mut t, _peer) = transport();
        assert_matches!(
            t.recv(PortKind::DownstreamRequest, RecvMode::NonBlocking),
            Err(OverlayError::WouldBlock)
        );
    }

    #[test]
    fn test_closed_port() {
        let (mut t, peer) = transport();
        drop(peer);
        assert_matches!(
            t.recv(PortKind::DownstreamRequest, RecvMode::Blocking),
            Err(OverlayError::PortClosed(PortKind::DownstreamRequest))
        );
        assert_matches!(
            t.send(PortKind::EventOut, &Envelope::event("a", None)),
            Err(OverlayError::PortClosed(PortKind::EventOut))
        );
    }

    #[test]
    fn test_send_to_full_port_does_not_block() {
        let config = OverlayConfig {
            channel_buffer_size: 1,
            ..OverlayConfig::dev_default(0, 4)
        };
        let (mut t, peer) = ChannelTransport::new(&config);
        let event = Envelope::event("event.live.up.1", None);
        t.send(PortKind::EventOut, &event).unwrap();
        assert_matches!(
            t.send(PortKind::EventOut, &event),
            Err(OverlayError::PortFull(PortKind::EventOut))
        );
        assert_eq!(peer.drain_sent(PortKind::EventOut).len(), 1);
        t.send(PortKind::EventOut, &event).unwrap();
    }

    #[test]
    fn test_send_and_observe() {
        let (mut t, peer) = transport();
        let msg = Envelope::request("live.hello.1", Some(Payload::new().with("epoch", 1)));
        t.send(PortKind::UpstreamRequest, &msg).unwrap();
        assert_eq!(peer.try_recv_sent(PortKind::UpstreamRequest).unwrap(), msg);
        assert_matches!(
            peer.try_recv_sent(PortKind::UpstreamRequest),
            Err(OverlayError::WouldBlock)
        );
    }

    #[test]
    fn test_direction_checks() {
        let (mut t, _peer) = transport();
        assert_matches!(
            t.send(PortKind::EventIn, &Envelope::event("a", None)),
            Err(OverlayError::InvalidArgument(_))
        );
        assert_matches!(
            t.recv(PortKind::EventOut, RecvMode::NonBlocking),
            Err(OverlayError::InvalidArgument(_))
        );
    }

    #[test]
    fn test_event_subscription_filter() {
        let (mut t, peer) = transport();
        peer.deliver(PortKind::EventIn, &Envelope::event("event.live.up.1", None))
            .unwrap();
        // Nothing subscribed yet: filtered out.
        assert_matches!(
            t.recv(PortKind::EventIn, RecvMode::NonBlocking),
            Err(OverlayError::WouldBlock)
        );

        t.subscribe("event.live.").unwrap();
        t.subscribe("event.live.").unwrap();
        assert_eq!(t.subscriptions().len(), 1);
        peer.deliver(PortKind::EventIn, &Envelope::event("event.other", None))
            .unwrap();
        peer.deliver(PortKind::EventIn, &Envelope::event("event.live.down.2", None))
            .unwrap();
        let got = t.recv(PortKind::EventIn, RecvMode::NonBlocking).unwrap();
        assert!(got.matches("event.live.down.2"));

        t.unsubscribe("event.live.").unwrap();
        peer.deliver(PortKind::EventIn, &Envelope::event("event.live.up.3", None))
            .unwrap();
        assert_matches!(
            t.recv(PortKind::EventIn, RecvMode::NonBlocking),
            Err(OverlayError::WouldBlock)
        );
    }

    #[test]
    fn test_malformed_input_is_skipped() {
        let (mut t, peer) = transport();
        peer.deliver_raw(PortKind::DownstreamRequest, vec![0xde, 0xad])
            .unwrap();
        let good = Envelope::request("live.query", None);
        peer.deliver(PortKind::DownstreamRequest, &good).unwrap();
        assert_eq!(
            t.recv(PortKind::DownstreamRequest, RecvMode::NonBlocking)
                .unwrap(),
            good
        );
    }

    #[test]
    fn test_requeue_goes_ahead_of_channel() {
        let (mut t, peer) = transport();
        peer.deliver(PortKind::DownstreamRequest, &Envelope::request("c", None))
            .unwrap();
        t.requeue(PortKind::DownstreamRequest, Envelope::request("b", None))
            .unwrap();
        t.requeue(PortKind::DownstreamRequest, Envelope::request("a", None))
            .unwrap();
        let order: Vec<_> = (0..3)
            .map(|_| {
                t.recv(PortKind::DownstreamRequest, RecvMode::NonBlocking)
                    .unwrap()
                    .topic
                    .unwrap()
            })
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn test_oversized_send_rejected() {
        let mut cfg = OverlayConfig::dev_default(0, 4);
        cfg.max_message_size = 8;
        let (mut t, _peer) = ChannelTransport::new(&cfg);
        assert_matches!(
            t.send(PortKind::EventOut, &Envelope::event("event.live.up.1", None)),
            Err(OverlayError::MessageTooLarge { max: 8, .. })
        );
    }
}
