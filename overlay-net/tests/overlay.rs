//! End-to-end tests: several brokers joined by a hand-driven fabric.

use {
    std::{thread, time::Duration},
    trv1_overlay_net::{
        kvs::MemoryStore,
        live::{LiveSnapshot, TRIGGER_PREFIX},
        port::{ChannelTransport, TransportPeer},
        Broker, Envelope, Handle, OverlayConfig, OverlayError, Payload, PortKind,
    },
};

const WAIT: Duration = Duration::from_secs(5);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Node {
    broker: Broker<ChannelTransport, MemoryStore>,
    peer: TransportPeer,
    alive: bool,
}

/// Brokers plus the routing between them: hellos go to the sender's
/// current parent, published events go to every live broker.
struct Cluster {
    nodes: Vec<Node>,
}

impl Cluster {
    /// Rank 0 is the root; 1 and 2 hang off it; 3 hangs off 1 and fails
    /// over to 0.
    fn new() -> Self {
        let configs = [
            OverlayConfig::dev_default(0, 4),
            OverlayConfig::dev_default(1, 4).with_parents(&[0]),
            OverlayConfig::dev_default(2, 4).with_parents(&[0]),
            OverlayConfig::dev_default(3, 4).with_parents(&[1, 0]),
        ];
        let nodes = configs
            .iter()
            .map(|config| {
                let (transport, peer) = ChannelTransport::new(config);
                let identity = format!("rank-{}", config.rank);
                let broker = Broker::new(config, transport, identity, MemoryStore::new()).unwrap();
                Node {
                    broker,
                    peer,
                    alive: true,
                }
            })
            .collect();
        Self { nodes }
    }

    fn settle(&mut self) {
        loop {
            let mut moved = 0usize;
            for node in self.nodes.iter_mut().filter(|n| n.alive) {
                moved = moved.saturating_add(node.broker.run_until_idle().unwrap());
            }

            let mut hellos = Vec::new();
            let mut events = Vec::new();
            for node in &self.nodes {
                let sent_up = node.peer.drain_sent(PortKind::UpstreamRequest);
                let sent_events = node.peer.drain_sent(PortKind::EventOut);
                if !node.alive {
                    continue;
                }
                if let Some(parent) = node.broker.live().current_parent() {
                    hellos.extend(sent_up.into_iter().map(|h| (parent, h)));
                }
                events.extend(sent_events);
            }
            for (parent, hello) in &hellos {
                let target = &self.nodes[*parent as usize];
                if target.alive {
                    target
                        .peer
                        .deliver(PortKind::DownstreamRequest, hello)
                        .unwrap();
                }
            }
            for event in &events {
                for node in self.nodes.iter().filter(|n| n.alive) {
                    node.peer.deliver(PortKind::EventIn, event).unwrap();
                }
            }
            moved = moved
                .saturating_add(hellos.len())
                .saturating_add(events.len());
            if moved == 0 {
                return;
            }
        }
    }

    fn tick(&mut self, epoch: u64) {
        let trigger = Envelope::event(format!("{TRIGGER_PREFIX}{epoch}"), None);
        for node in self.nodes.iter().filter(|n| n.alive) {
            node.peer.deliver(PortKind::EventIn, &trigger).unwrap();
        }
        self.settle();
    }

    fn up_everywhere(&self, rank: u32) -> Vec<bool> {
        self.nodes
            .iter()
            .filter(|n| n.alive)
            .map(|n| n.broker.live().is_up(rank))
            .collect()
    }
}

#[test]
fn test_silent_child_marked_down_then_up() {
    init_logger();
    let mut cluster = Cluster::new();
    for epoch in 1..=3 {
        cluster.tick(epoch);
    }
    assert_eq!(cluster.nodes[1].broker.live().child(3).unwrap().epoch, 3);
    assert_eq!(cluster.nodes[0].broker.live().child_count(), 2);

    cluster.nodes[3].alive = false;
    cluster.tick(4);
    cluster.tick(5);
    assert_eq!(cluster.up_everywhere(3), vec![true, true, true]);

    cluster.tick(6);
    assert_eq!(cluster.up_everywhere(3), vec![false, false, false]);
    assert!(cluster.nodes[1].broker.live().child(3).is_none());
    assert_eq!(cluster.nodes[0].broker.live().down_ranks(), vec![3]);

    cluster.nodes[3].alive = true;
    cluster.tick(7);
    assert_eq!(cluster.up_everywhere(3), vec![true, true, true, true]);
    assert_eq!(cluster.nodes[1].broker.live().child(3).unwrap().epoch, 7);
}

#[test]
fn test_healthy_cluster_stays_up() {
    init_logger();
    let mut cluster = Cluster::new();
    for epoch in 1..=10 {
        cluster.tick(epoch);
    }
    for rank in 0..4 {
        assert_eq!(cluster.up_everywhere(rank), vec![true; 4]);
    }
}

/// Serve requests from `client_peer` with `broker` until the client goes
/// away, passing every reply back.
fn serve(
    mut broker: Broker<ChannelTransport, MemoryStore>,
    broker_peer: TransportPeer,
    client_peer: TransportPeer,
) -> thread::JoinHandle<Broker<ChannelTransport, MemoryStore>> {
    thread::spawn(move || {
        while let Ok(request) = client_peer.recv_sent(PortKind::UpstreamRequest, WAIT) {
            broker_peer
                .deliver(PortKind::DownstreamRequest, &request)
                .unwrap();
            broker.run_until_idle().unwrap();
            for reply in broker_peer.drain_sent(PortKind::DownstreamRequest) {
                client_peer
                    .deliver(PortKind::DownstreamRequest, &reply)
                    .unwrap();
            }
        }
        broker
    })
}

fn client_and_server() -> (
    Handle<ChannelTransport>,
    thread::JoinHandle<Broker<ChannelTransport, MemoryStore>>,
) {
    let config = OverlayConfig::dev_default(0, 3);
    let (transport, broker_peer) = ChannelTransport::new(&config);
    let broker = Broker::new(&config, transport, "rank-0", MemoryStore::new()).unwrap();
    let (client_transport, client_peer) = ChannelTransport::new(&config);
    let client = Handle::new(client_transport, 0, "client-5");
    (client, serve(broker, broker_peer, client_peer))
}

#[test]
fn test_live_query_over_rpc() {
    init_logger();
    let (mut client, server) = client_and_server();
    let reply = client.call(0, "live.query", None).unwrap().unwrap();
    let snapshot: LiveSnapshot = reply.to_typed().unwrap();
    assert_eq!(snapshot.up, vec![0, 1, 2]);
    assert!(snapshot.down.is_empty());
    assert_eq!(snapshot.nnodes, 3);

    drop(client);
    server.join().unwrap();
}

#[test]
fn test_kvs_put_commit_get() {
    init_logger();
    let (mut client, server) = client_and_server();

    for (key, val) in [("a", "1"), ("b", "2"), ("a", "3")] {
        let body = Payload::new().with("key", key).with("val", val);
        client.request(0, "kvs.put", Some(body)).unwrap();
    }
    let committed = client
        .call(0, "kvs.commit", Some(Payload::new().with("tag", "c1")))
        .unwrap()
        .unwrap();
    assert_eq!(committed.get_u64("putcount"), Some(3));
    assert_eq!(committed.get_u64("errcount"), Some(0));
    assert_eq!(committed.get_str("tag"), Some("c1"));

    let got = client
        .call(0, "kvs.get", Some(Payload::new().with("key", "a")))
        .unwrap()
        .unwrap();
    assert_eq!(got.get_str("val"), Some("3"));

    let missing = client
        .call(0, "kvs.get", Some(Payload::new().with("key", "zz")))
        .unwrap()
        .unwrap();
    assert_eq!(missing.get_str("key"), Some("zz"));
    assert!(!missing.contains_key("val"));

    let recommit = client.call(0, "kvs.commit", Some(Payload::new())).unwrap().unwrap();
    assert_eq!(recommit.get_u64("putcount"), Some(0));

    client.request(0, "kvs.disconnect", None).unwrap();
    assert!(matches!(client.request(0, "", None), Err(OverlayError::InvalidArgument(_))));

    drop(client);
    let broker = server.join().unwrap();
    assert_eq!(broker.kvs().client_count(), 0);
    assert_eq!(broker.kvs().store().len(), 2);
}
