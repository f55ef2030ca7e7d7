//! Single-threaded broker reactor.
//!
//! A [`Broker`] reads one envelope at a time from its transport, hands it
//! to the service that owns its topic and sends whatever the service asks
//! for before reading the next one.  Services never touch the transport
//! themselves.

use {
    crate::{
        config::OverlayConfig,
        error::{OverlayError, Result},
        handle::Handle,
        kvs::{KvStore, KvsService},
        live::{LiveService, LIVE_EVENT_PREFIX, TRIGGER_PREFIX},
        message::{Envelope, MessageType},
        port::{Outbound, PortKind, RecvMode, Transport},
    },
    log::{debug, info, warn},
};

/// Event prefixes every broker subscribes to at startup.
pub const REQUIRED_SUBSCRIPTIONS: [&str; 2] = [TRIGGER_PREFIX, LIVE_EVENT_PREFIX];

#[derive(Debug)]
pub struct Broker<T: Transport, S: KvStore> {
    handle: Handle<T>,
    live: LiveService,
    kvs: KvsService<S>,
}

impl<T: Transport, S: KvStore> Broker<T, S> {
    /// Build a broker over `transport`.
    ///
    /// `identity` is the hop this broker pushes onto requests it sends.
    pub fn new(
        config: &OverlayConfig,
        transport: T,
        identity: impl Into<String>,
        store: S,
    ) -> Result<Self> {
        config.validate()?;
        let mut handle = Handle::new(transport, config.rank, identity);
        handle.set_facility(&config.facility);
        for prefix in REQUIRED_SUBSCRIPTIONS {
            handle.transport_mut().subscribe(prefix)?;
        }
        info!(
            "rank {} of {} up as {} (parents {:?})",
            config.rank,
            config.size,
            handle.identity(),
            config.parents.iter().map(|p| p.rank).collect::<Vec<_>>()
        );
        Ok(Self {
            handle,
            live: LiveService::new(config),
            kvs: KvsService::new(store),
        })
    }

    pub fn handle(&self) -> &Handle<T> {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut Handle<T> {
        &mut self.handle
    }

    pub fn live(&self) -> &LiveService {
        &self.live
    }

    pub fn live_mut(&mut self) -> &mut LiveService {
        &mut self.live
    }

    pub fn kvs(&self) -> &KvsService<S> {
        &self.kvs
    }

    /// Run the handler owning `envelope`'s topic and send its output.
    ///
    /// Returns `false` if no service owns the topic.  Every output envelope
    /// is attempted even if an earlier send fails, since the handler has
    /// already applied its state change; the first failure is returned.
    pub fn dispatch(&mut self, envelope: &Envelope) -> Result<bool> {
        let outbound = if let Some(output) = self.live.handle(envelope) {
            output.outbound
        } else if let Some(outbound) = self.kvs.handle(envelope) {
            outbound
        } else {
            debug!("no handler for {}", envelope);
            return Ok(false);
        };
        let mut first_err = None;
        for Outbound { port, envelope } in outbound {
            let summary = envelope.to_string();
            if let Err(e) = self.send(port, envelope) {
                warn!("failed to send {} on {} port: {}", summary, port, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    fn send(&mut self, port: PortKind, mut envelope: Envelope) -> Result<()> {
        if port == PortKind::UpstreamRequest && envelope.route.is_some() {
            envelope.push_route(self.handle.identity().to_string());
        }
        self.handle.send(port, &envelope)
    }

    /// Receive one envelope from `port` and dispatch it.
    ///
    /// Responses arriving from upstream are forwarded back down instead.
    pub fn poll(&mut self, port: PortKind, mode: RecvMode) -> Result<bool> {
        let envelope = self.handle.recv(port, mode)?;
        if port == PortKind::UpstreamRequest && envelope.msg_type == MessageType::Response {
            return self.forward_response(envelope);
        }
        self.dispatch(&envelope)
    }

    /// Pop this broker's hop off a response and pass it downstream.
    pub fn forward_response(&mut self, mut envelope: Envelope) -> Result<bool> {
        match envelope.pop_route() {
            Some(hop) if hop == self.handle.identity() => {
                self.handle.send(PortKind::DownstreamRequest, &envelope)?;
                Ok(true)
            }
            hop => Err(OverlayError::Protocol(format!(
                "response {} not routed through {} (top hop {:?})",
                envelope,
                self.handle.identity(),
                hop
            ))),
        }
    }

    /// Dispatch everything waiting on the inbound ports without blocking.
    ///
    /// Returns the number of envelopes handled.  A protocol error is
    /// logged and the loop moves on; any other error stops it.
    pub fn run_until_idle(&mut self) -> Result<usize> {
        let mut handled = 0usize;
        loop {
            let mut progress = false;
            for port in PortKind::ALL.into_iter().filter(|p| p.can_recv()) {
                loop {
                    match self.poll(port, RecvMode::NonBlocking) {
                        Ok(_) => {
                            handled = handled.saturating_add(1);
                            progress = true;
                        }
                        Err(OverlayError::WouldBlock) => break,
                        Err(e) if e.is_protocol() => {
                            warn!("rank {}: {}", self.handle.rank(), e);
                            progress = true;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            if !progress {
                return Ok(handled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            kvs::MemoryStore,
            live::{Hello, LiveSnapshot, QUERY_TOPIC},
            payload::Payload,
            port::{ChannelTransport, TransportPeer},
        },
        assert_matches::assert_matches,
        std::io,
    };

    /// Channel transport whose upstream link is dead.
    #[derive(Debug)]
    struct NoUpstream(ChannelTransport);

    impl Transport for NoUpstream {
        fn send(&mut self, port: PortKind, envelope: &Envelope) -> Result<()> {
            if port == PortKind::UpstreamRequest {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
            }
            self.0.send(port, envelope)
        }

        fn recv(&mut self, port: PortKind, mode: RecvMode) -> Result<Envelope> {
            self.0.recv(port, mode)
        }

        fn requeue(&mut self, port: PortKind, envelope: Envelope) -> Result<()> {
            self.0.requeue(port, envelope)
        }

        fn subscribe(&mut self, prefix: &str) -> Result<()> {
            self.0.subscribe(prefix)
        }

        fn unsubscribe(&mut self, prefix: &str) -> Result<()> {
            self.0.unsubscribe(prefix)
        }
    }

    fn broker(config: &OverlayConfig) -> (Broker<ChannelTransport, MemoryStore>, TransportPeer) {
        let (transport, peer) = ChannelTransport::new(config);
        let identity = format!("rank-{}", config.rank);
        let broker = Broker::new(config, transport, identity, MemoryStore::new()).unwrap();
        (broker, peer)
    }

    fn tick(epoch: u64) -> Envelope {
        Envelope::event(format!("{TRIGGER_PREFIX}{epoch}"), None)
    }

    #[test]
    fn test_new_installs_subscriptions() {
        let config = OverlayConfig::dev_default(1, 2).with_parents(&[0]);
        let (broker, _peer) = broker(&config);
        assert_eq!(
            broker.handle().transport().subscriptions(),
            &["event.sched.trigger.", "event.live."]
        );
        assert_eq!(broker.handle().facility(), "unknown");
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let config = OverlayConfig::dev_default(4, 4);
        let (transport, _peer) = ChannelTransport::new(&config);
        assert_matches!(
            Broker::new(&config, transport, "x", MemoryStore::new()),
            Err(OverlayError::InvalidConfig(_))
        );
    }

    #[test]
    fn test_tick_sends_hello_with_route() {
        let config = OverlayConfig::dev_default(2, 4).with_parents(&[0, 1]);
        let (mut broker, peer) = broker(&config);
        peer.deliver(PortKind::EventIn, &tick(3)).unwrap();
        assert_eq!(broker.run_until_idle().unwrap(), 1);

        let hello = peer.try_recv_sent(PortKind::UpstreamRequest).unwrap();
        assert!(hello.matches("live.hello.2"));
        assert_eq!(hello.sender(), Some("rank-2"));
        let body: Hello = hello.payload.unwrap().to_typed().unwrap();
        assert_eq!(
            body,
            Hello {
                epoch: 3,
                parent: 0,
            }
        );
    }

    #[test]
    fn test_query_answered_downstream() {
        let config = OverlayConfig::dev_default(0, 3);
        let (mut broker, peer) = broker(&config);
        let mut query = Envelope::request(QUERY_TOPIC, None);
        query.push_route("client-7");
        peer.deliver(PortKind::DownstreamRequest, &query).unwrap();
        peer.deliver(PortKind::EventIn, &Envelope::event("event.live.down.2", None))
            .unwrap();

        // Event-in is drained after downstream-request, so the query sees
        // every rank up.
        assert_eq!(broker.run_until_idle().unwrap(), 2);
        let reply = peer.try_recv_sent(PortKind::DownstreamRequest).unwrap();
        assert_eq!(reply.route, query.route);
        let snapshot: LiveSnapshot = reply.payload.unwrap().to_typed().unwrap();
        assert_eq!(snapshot.up, vec![0, 1, 2]);
        assert!(!broker.live().is_up(2));
    }

    #[test]
    fn test_kvs_routed_to_store() {
        let config = OverlayConfig::dev_default(0, 2);
        let (mut broker, peer) = broker(&config);
        let body = Payload::new().with("key", "a").with("val", "1");
        let mut put = Envelope::request("kvs.put", Some(body));
        put.push_route("client-1");
        let mut commit = Envelope::request("kvs.commit", Some(Payload::new()));
        commit.push_route("client-1");

        assert!(broker.dispatch(&put).unwrap());
        assert!(broker.dispatch(&commit).unwrap());
        let reply = peer.try_recv_sent(PortKind::DownstreamRequest).unwrap();
        let body = reply.payload.unwrap();
        assert_eq!(body.get_u64("putcount"), Some(1));
        assert_eq!(body.get_u64("errcount"), Some(0));
        assert_eq!(broker.kvs().store().len(), 1);
    }

    #[test]
    fn test_unknown_topic_not_handled() {
        let config = OverlayConfig::dev_default(0, 2);
        let (mut broker, peer) = broker(&config);
        assert!(!broker.dispatch(&Envelope::request("nosuch.thing", None)).unwrap());
        assert!(peer.drain_sent(PortKind::DownstreamRequest).is_empty());
    }

    #[test]
    fn test_malformed_input_does_not_stop_loop() {
        let config = OverlayConfig::dev_default(0, 2);
        let (mut broker, peer) = broker(&config);
        peer.deliver_raw(PortKind::DownstreamRequest, vec![0xde, 0xad])
            .unwrap();
        peer.deliver(PortKind::DownstreamRequest, &Envelope::request(QUERY_TOPIC, None))
            .unwrap();
        assert_eq!(broker.run_until_idle().unwrap(), 1);
        assert!(peer.try_recv_sent(PortKind::DownstreamRequest).is_ok());
    }

    #[test]
    fn test_run_until_idle_fails_when_ports_close() {
        let config = OverlayConfig::dev_default(0, 2);
        let (mut broker, peer) = broker(&config);
        drop(peer);
        assert_matches!(broker.run_until_idle(), Err(OverlayError::PortClosed(_)));
    }

    #[test]
    fn test_down_event_sent_when_hello_send_fails() {
        let config = OverlayConfig::dev_default(1, 4).with_parents(&[0]);
        let (transport, peer) = ChannelTransport::new(&config);
        let mut broker =
            Broker::new(&config, NoUpstream(transport), "rank-1", MemoryStore::new()).unwrap();

        let body = Payload::from_serialize(&Hello {
            epoch: 1,
            parent: 1,
        })
        .unwrap();
        let mut hello = Envelope::request("live.hello.3", Some(body));
        hello.push_route("rank-3");
        assert!(broker.dispatch(&hello).unwrap());

        for epoch in 1..=5 {
            assert_matches!(broker.dispatch(&tick(epoch)), Err(OverlayError::Transport(_)));
        }
        assert!(!broker.live().is_up(3));
        assert!(broker.live().child(3).is_none());
        let events = peer.drain_sent(PortKind::EventOut);
        assert_eq!(events.len(), 1);
        assert!(events[0].matches("event.live.down.3"));
    }

    #[test]
    fn test_upstream_response_forwarded_down() {
        let config = OverlayConfig::dev_default(1, 4).with_parents(&[0]);
        let (mut broker, peer) = broker(&config);
        let mut request = Envelope::request(QUERY_TOPIC, None);
        request.push_route("client-4");
        request.push_route("rank-1");
        let reply = Envelope::response_to(&request, 0, Some(Payload::new()));
        let mut stray = Envelope::response_to(&request, 0, None);
        stray.pop_route();
        peer.deliver(PortKind::UpstreamRequest, &stray).unwrap();
        peer.deliver(PortKind::UpstreamRequest, &reply).unwrap();

        // The stray response is a protocol error and is skipped.
        assert_eq!(broker.run_until_idle().unwrap(), 1);
        let forwarded = peer.try_recv_sent(PortKind::DownstreamRequest).unwrap();
        assert_eq!(forwarded.route, Some(vec!["client-4".to_string()]));
        assert_eq!(forwarded.payload, reply.payload);
        assert!(peer.try_recv_sent(PortKind::DownstreamRequest).is_err());
    }
}
