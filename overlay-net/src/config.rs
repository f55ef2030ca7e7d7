//! Configuration for the overlay messaging layer.

use {
    crate::error::{OverlayError, Result},
    serde::{Deserialize, Serialize},
    std::net::SocketAddr,
};

/// Default number of epochs a child may miss before it is declared down.
pub const DEFAULT_MISSED_EPOCH_ALLOW: u64 = 2;

/// A parent in the overlay tree, in failover order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentInfo {
    /// Rank of the parent broker.
    pub rank: u32,
    /// Where the parent can be reached, if the transport needs it.
    pub uri: Option<String>,
}

impl ParentInfo {
    pub fn new(rank: u32) -> Self {
        Self { rank, uri: None }
    }
}

/// Configuration for one broker process in the overlay.
///
/// Supplied once at startup by the process launcher and treated as
/// read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// This broker's rank, in `[0, size)`.
    pub rank: u32,

    /// Total number of ranks in the cluster.
    pub size: u32,

    /// Parents in failover order. Empty on the root.
    /// `parents[0]` is the primary parent declared in hello messages.
    pub parents: Vec<ParentInfo>,

    /// Children monitored from startup, before their first hello.
    pub live_children: Vec<u32>,

    /// Log liveness transitions.
    pub verbose: bool,

    /// Epochs a child may stay silent before it is marked down.
    pub missed_epoch_allow: u64,

    /// Maximum size of a single encoded envelope in bytes.
    pub max_message_size: usize,

    /// Maximum route stack depth accepted on decode. Bounded by tree depth.
    pub max_route_depth: usize,

    /// Size of the in-process port channels.
    pub channel_buffer_size: usize,

    /// Local address for the framed TCP carrier.
    pub bind_addr: SocketAddr,

    /// Initial facility for structured log records.
    pub facility: String,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            size: 1,
            parents: Vec::new(),
            live_children: Vec::new(),
            verbose: false,
            missed_epoch_allow: DEFAULT_MISSED_EPOCH_ALLOW,
            max_message_size: 1_048_576, // 1 MB
            max_route_depth: 64,
            channel_buffer_size: 10_000,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5556)),
            facility: "unknown".to_string(),
        }
    }
}

impl OverlayConfig {
    /// Create a config suitable for local testing.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default(rank: u32, size: u32) -> Self {
        Self {
            rank,
            size,
            verbose: true,
            max_route_depth: 16,
            channel_buffer_size: 1_000,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }

    /// Builder-style helper: set the parent list.
    pub fn with_parents(mut self, ranks: &[u32]) -> Self {
        self.parents = ranks.iter().copied().map(ParentInfo::new).collect();
        self
    }

    /// Builder-style helper: set the pre-registered children.
    pub fn with_live_children(mut self, ranks: &[u32]) -> Self {
        self.live_children = ranks.to_vec();
        self
    }

    /// Whether `rank` names a node in this cluster.
    #[inline]
    pub fn rank_in_range(&self, rank: u32) -> bool {
        rank < self.size
    }

    /// Rank of the primary parent, if any.
    pub fn primary_parent(&self) -> Option<u32> {
        self.parents.first().map(|p| p.rank)
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(OverlayError::InvalidConfig("size must be nonzero".into()));
        }
        if !self.rank_in_range(self.rank) {
            return Err(OverlayError::InvalidConfig(format!(
                "rank {} outside cluster of size {}",
                self.rank, self.size
            )));
        }
        for parent in &self.parents {
            if !self.rank_in_range(parent.rank) {
                return Err(OverlayError::InvalidConfig(format!(
                    "parent rank {} outside cluster of size {}",
                    parent.rank, self.size
                )));
            }
            if parent.rank == self.rank {
                return Err(OverlayError::InvalidConfig(format!(
                    "rank {} lists itself as a parent",
                    self.rank
                )));
            }
        }
        if let Some(child) = self.live_children.iter().find(|c| !self.rank_in_range(**c)) {
            return Err(OverlayError::InvalidConfig(format!(
                "live child rank {} outside cluster of size {}",
                child, self.size
            )));
        }
        if self.max_route_depth == 0 {
            return Err(OverlayError::InvalidConfig(
                "max_route_depth must be nonzero".into(),
            ));
        }
        Ok(())
    }
}
