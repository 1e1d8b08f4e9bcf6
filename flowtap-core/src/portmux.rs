//! Port muxer table: the ordered list of `port_min..=port_max -> protocol`
//! bindings consulted when a TCP sub-parser has no cached child and no
//! connection-tracker hit to fall back on.
//!
//! Bindings are read on every new flow and written rarely (an operator
//! adding or removing a binding at runtime), so the table is published
//! through an [`arc_swap::ArcSwap`]: readers never block on a writer and
//! never see a torn update.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::PortBinding;
use crate::error::{EngineError, Result};

/// Hot-swappable, ordered set of TCP port bindings.
///
/// Order matters: the first binding whose range contains the port wins, so
/// a narrower range registered ahead of a broader catch-all takes
/// precedence. Both the segment's source and destination ports are tried,
/// source first, mirroring the original dissector's preference for
/// "the port that looks like a well-known server port."
pub struct PortMuxerTable {
    bindings: ArcSwap<Vec<PortBinding>>,
}

impl PortMuxerTable {
    pub fn new(initial: Vec<PortBinding>) -> Self {
        Self { bindings: ArcSwap::new(Arc::new(initial)) }
    }

    /// Appends a binding. Rejects an exact `(port_min, port_max)` duplicate
    /// so repeated config reloads don't pile up redundant entries.
    pub fn add(&self, binding: PortBinding) -> Result<()> {
        let current = self.bindings.load();
        if current.iter().any(|b| b.port_min == binding.port_min && b.port_max == binding.port_max) {
            return Err(EngineError::Config(format!(
                "port binding {}..={} already registered",
                binding.port_min, binding.port_max
            )));
        }
        let mut next = (**current).clone();
        next.push(binding);
        self.bindings.store(Arc::new(next));
        Ok(())
    }

    /// Removes every binding matching `name`. Returns the number removed.
    pub fn del(&self, name: &str) -> usize {
        let current = self.bindings.load();
        let mut next = (**current).clone();
        let before = next.len();
        next.retain(|b| b.name != name);
        let removed = before - next.len();
        if removed > 0 {
            self.bindings.store(Arc::new(next));
        }
        removed
    }

    /// Finds the first binding whose range covers `sport` or `dport`,
    /// source port checked first.
    pub fn find(&self, sport: u16, dport: u16) -> Option<String> {
        let current = self.bindings.load();
        current
            .iter()
            .find(|b| b.port_min <= sport && sport <= b.port_max)
            .or_else(|| current.iter().find(|b| b.port_min <= dport && dport <= b.port_max))
            .map(|b| b.name.clone())
    }

    /// Returns a snapshot of the current bindings, in registration order.
    pub fn snapshot(&self) -> Vec<PortBinding> {
        (**self.bindings.load()).clone()
    }
}
