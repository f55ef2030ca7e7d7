//! Node liveness tracking (failure detector).
//!
//! Every broker keeps an up/down bit for every rank in the cluster, all
//! starting up.  Evidence arrives over the tree:
//!
//! - On each scheduler tick (`event.sched.trigger.<epoch>`) a broker whose
//!   parent is up sends `live.hello.<rank>` upstream, declaring its primary
//!   parent.  Heartbeats travel one hop only.
//! - A parent records the epoch of the last hello from each child.  Once
//!   it has seen more than `missed_epoch_allow` ticks itself, any child
//!   whose last hello is older than that many epochs is published as
//!   `event.live.down.<rank>` and forgotten.
//! - A hello from a rank believed down publishes `event.live.up.<rank>`.
//! - When a rank comes back up, children that declared it as their parent
//!   are dropped here: the real parent watches them again.
//! - `live.query` answers with the current up and down lists.
//!
//! [`LiveService`] is pure state-machine logic.  Every handler returns a
//! [`LiveOutput`] naming the envelopes to send and their ports; I/O is the
//! caller's job.

use {
    crate::{
        config::OverlayConfig,
        error::{OverlayError, Result},
        message::{Envelope, MessageType},
        payload::Payload,
        port::{Outbound, PortKind},
    },
    log::{debug, info},
    serde::{Deserialize, Serialize},
    std::collections::BTreeMap,
};

pub const TRIGGER_PREFIX: &str = "event.sched.trigger.";
pub const HELLO_PREFIX: &str = "live.hello.";
pub const QUERY_TOPIC: &str = "live.query";
pub const LIVE_EVENT_PREFIX: &str = "event.live.";
pub const UP_EVENT_PREFIX: &str = "event.live.up.";
pub const DOWN_EVENT_PREFIX: &str = "event.live.down.";

/// A child heard from (or pre-registered) by this broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Child {
    pub rank: u32,
    /// Epoch of the most recent hello.
    pub epoch: u64,
    /// Parent the child declared; may differ from this broker when we are
    /// covering for a failed parent.
    pub parent: u32,
}

/// Body of a `live.hello.<rank>` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub epoch: u64,
    pub parent: u32,
}

/// Body of a `live.query` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSnapshot {
    pub up: Vec<u32>,
    pub down: Vec<u32>,
    pub nnodes: u32,
}

/// Result of handling one liveness message.
#[derive(Debug, Default, PartialEq)]
pub struct LiveOutput {
    pub outbound: Vec<Outbound>,
}

impl LiveOutput {
    fn push(&mut self, port: PortKind, envelope: Envelope) {
        self.outbound.push(Outbound { port, envelope });
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
    }

    /// Events published by this output.
    pub fn events(&self) -> impl Iterator<Item = &Envelope> {
        self.outbound
            .iter()
            .filter(|o| o.port == PortKind::EventOut)
            .map(|o| &o.envelope)
    }
}

pub fn up_event(rank: u32) -> Envelope {
    Envelope::event(format!("{UP_EVENT_PREFIX}{rank}"), None)
}

pub fn down_event(rank: u32) -> Envelope {
    Envelope::event(format!("{DOWN_EVENT_PREFIX}{rank}"), None)
}

/// Per-broker liveness state.
#[derive(Debug)]
pub struct LiveService {
    rank: u32,
    size: u32,
    parents: Vec<u32>,
    parent_cur: usize,
    missed_epoch_allow: u64,
    verbose: bool,
    /// `state[r]` is true while rank `r` is believed up.
    state: Vec<bool>,
    /// Ticks seen so far.
    age: u64,
    /// Ordered by rank, so stale children are evicted lowest rank first.
    children: BTreeMap<u32, Child>,
}

impl LiveService {
    pub fn new(config: &OverlayConfig) -> Self {
        let children = config
            .live_children
            .iter()
            .map(|&rank| {
                (
                    rank,
                    Child {
                        rank,
                        epoch: 0,
                        parent: config.rank,
                    },
                )
            })
            .collect();
        Self {
            rank: config.rank,
            size: config.size,
            parents: config.parents.iter().map(|p| p.rank).collect(),
            parent_cur: 0,
            missed_epoch_allow: config.missed_epoch_allow,
            verbose: config.verbose,
            state: vec![true; config.size as usize],
            age: 0,
            children,
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    fn in_range(&self, rank: u32) -> bool {
        rank < self.size
    }

    /// Whether `rank` is believed up.  Out-of-range ranks are never up.
    pub fn is_up(&self, rank: u32) -> bool {
        self.state.get(rank as usize).copied().unwrap_or(false)
    }

    pub fn up_ranks(&self) -> Vec<u32> {
        (0..self.size).filter(|&r| self.is_up(r)).collect()
    }

    pub fn down_ranks(&self) -> Vec<u32> {
        (0..self.size).filter(|&r| !self.is_up(r)).collect()
    }

    pub fn snapshot(&self) -> LiveSnapshot {
        LiveSnapshot {
            up: self.up_ranks(),
            down: self.down_ranks(),
            nnodes: self.size,
        }
    }

    pub fn age(&self) -> u64 {
        self.age
    }

    pub fn child(&self, rank: u32) -> Option<&Child> {
        self.children.get(&rank)
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Rank of the parent currently in use, if any.
    pub fn current_parent(&self) -> Option<u32> {
        self.parents.get(self.parent_cur).copied()
    }

    /// Switch to the parent at `index` in the configured failover list.
    pub fn select_parent(&mut self, index: usize) -> Result<()> {
        if index >= self.parents.len() {
            return Err(OverlayError::InvalidArgument(format!(
                "parent index {index} out of {} configured",
                self.parents.len()
            )));
        }
        self.parent_cur = index;
        Ok(())
    }

    /// Whether the current parent is believed up.
    pub fn has_live_parent(&self) -> bool {
        self.current_parent().is_some_and(|p| self.is_up(p))
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Handle `envelope` if its topic belongs to liveness.
    ///
    /// Returns `None` for topics this service does not own.  Malformed
    /// liveness messages are ignored and produce an empty output.
    pub fn handle(&mut self, envelope: &Envelope) -> Option<LiveOutput> {
        let output = if let Some(arg) = envelope.match_prefix(TRIGGER_PREFIX) {
            self.dispatch_event(envelope, arg, |live, epoch| live.on_tick(epoch))
        } else if envelope.matches(QUERY_TOPIC) {
            match envelope.msg_type {
                MessageType::Request => self.on_query(envelope),
                _ => LiveOutput::default(),
            }
        } else if let Some(arg) = envelope.match_prefix(HELLO_PREFIX) {
            self.dispatch_hello(envelope, arg)
        } else if let Some(arg) = envelope.match_prefix(UP_EVENT_PREFIX) {
            self.dispatch_event(envelope, arg, |live, rank| live.on_up_rank(rank))
        } else if let Some(arg) = envelope.match_prefix(DOWN_EVENT_PREFIX) {
            self.dispatch_event(envelope, arg, |live, rank| live.on_down_rank(rank))
        } else {
            return None;
        };
        Some(output)
    }

    fn dispatch_event<F>(&mut self, envelope: &Envelope, arg: &str, f: F) -> LiveOutput
    where
        F: FnOnce(&mut Self, u64) -> LiveOutput,
    {
        if envelope.msg_type != MessageType::Event {
            debug!("ignoring {}: not an event", envelope);
            return LiveOutput::default();
        }
        match arg.parse::<u64>() {
            Ok(n) => f(self, n),
            Err(_) => {
                debug!("ignoring {}: bad topic suffix", envelope);
                LiveOutput::default()
            }
        }
    }

    fn dispatch_hello(&mut self, envelope: &Envelope, arg: &str) -> LiveOutput {
        if envelope.msg_type != MessageType::Request {
            debug!("ignoring {}: not a request", envelope);
            return LiveOutput::default();
        }
        let Ok(rank) = arg.parse::<u32>() else {
            debug!("ignoring {}: bad rank", envelope);
            return LiveOutput::default();
        };
        let Some(hello) = envelope
            .payload
            .as_ref()
            .and_then(|p| p.to_typed::<Hello>().ok())
        else {
            debug!("ignoring {}: malformed hello", envelope);
            return LiveOutput::default();
        };
        self.on_hello(rank, hello)
    }

    // ── Handlers ────────────────────────────────────────────────────────

    /// Scheduler tick for `epoch`: say hello upstream, then age children.
    pub fn on_tick(&mut self, epoch: u64) -> LiveOutput {
        let mut output = LiveOutput::default();

        if self.has_live_parent() {
            output.push(PortKind::UpstreamRequest, self.hello_request(epoch));
        }

        let aged = self.age >= self.missed_epoch_allow;
        self.age = self.age.saturating_add(1);
        if !aged {
            return output;
        }

        while let Some(rank) = self.find_stale_child(epoch) {
            if let Some(child) = self.children.remove(&rank) {
                if self.in_range(rank) {
                    self.note(format_args!(
                        "rank {} is stale ({}:{}), marking down",
                        rank, child.epoch, epoch
                    ));
                    self.state[rank as usize] = false;
                    output.push(PortKind::EventOut, down_event(rank));
                }
            }
        }
        output
    }

    /// Hello from child `rank`.
    pub fn on_hello(&mut self, rank: u32, hello: Hello) -> LiveOutput {
        let mut output = LiveOutput::default();
        if !self.in_range(rank) {
            debug!("ignoring hello from out-of-range rank {}", rank);
            return output;
        }

        self.children
            .entry(rank)
            .and_modify(|child| child.epoch = child.epoch.max(hello.epoch))
            .or_insert(Child {
                rank,
                epoch: hello.epoch,
                parent: hello.parent,
            });

        if !self.state[rank as usize] {
            self.note(format_args!("heard from rank {}, marking up", rank));
            self.state[rank as usize] = true;
            output.push(PortKind::EventOut, up_event(rank));
        }
        output
    }

    /// `rank` is up: mark it and stop covering for its children.
    pub fn on_up(&mut self, rank: u32) -> LiveOutput {
        if self.in_range(rank) {
            self.state[rank as usize] = true;
            let before = self.children.len();
            self.children.retain(|_, child| child.parent != rank);
            let dropped = before.saturating_sub(self.children.len());
            if dropped > 0 {
                debug!("rank {} is up, no longer watching {} of its children", rank, dropped);
            }
        }
        LiveOutput::default()
    }

    /// `rank` is down.  The child table is left alone.
    pub fn on_down(&mut self, rank: u32) -> LiveOutput {
        if self.in_range(rank) {
            self.state[rank as usize] = false;
        }
        LiveOutput::default()
    }

    fn on_up_rank(&mut self, rank: u64) -> LiveOutput {
        match u32::try_from(rank) {
            Ok(rank) => self.on_up(rank),
            Err(_) => LiveOutput::default(),
        }
    }

    fn on_down_rank(&mut self, rank: u64) -> LiveOutput {
        match u32::try_from(rank) {
            Ok(rank) => self.on_down(rank),
            Err(_) => LiveOutput::default(),
        }
    }

    /// Answer a `live.query` request with the current snapshot.
    pub fn on_query(&self, request: &Envelope) -> LiveOutput {
        let mut output = LiveOutput::default();
        match Payload::from_serialize(&self.snapshot()) {
            Ok(payload) => output.push(
                PortKind::DownstreamRequest,
                Envelope::response_to(request, 0, Some(payload)),
            ),
            Err(e) => debug!("unable to encode live snapshot: {}", e),
        }
        output
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn hello_request(&self, epoch: u64) -> Envelope {
        let hello = Hello {
            epoch,
            parent: self.parents.first().copied().unwrap_or(self.rank),
        };
        let payload = Payload::new()
            .with("epoch", hello.epoch)
            .with("parent", hello.parent);
        let mut envelope = Envelope::request(format!("{HELLO_PREFIX}{}", self.rank), Some(payload));
        envelope.enable_route();
        envelope
    }

    /// First child (by rank) whose last hello is too old for `epoch`.
    fn find_stale_child(&self, epoch: u64) -> Option<u32> {
        self.children
            .values()
            .find(|child| child.epoch.saturating_add(self.missed_epoch_allow) < epoch)
            .map(|child| child.rank)
    }

    fn note(&self, args: std::fmt::Arguments<'_>) {
        if self.verbose {
            info!("{}", args);
        } else {
            debug!("{}", args);
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
