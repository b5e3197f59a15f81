//! Health aggregation rules.

use appdeck_state::{Instance, NodeStatus, PortMapping};

/// An instance is healthy when every port mapping is. An instance without
/// ports has nothing to fail and counts as healthy.
pub fn instance_healthy(mappings: &[PortMapping]) -> bool {
    mappings.iter().all(|m| m.healthy == Some(true))
}

/// Derive a node's status from the health of its instances.
///
/// Only instances with a defined health state take part: none ⇒
/// `Maintain`, all healthy ⇒ `Online`, otherwise `Offline`.
pub fn node_status(instances: &[Instance]) -> NodeStatus {
    let mut defined = instances.iter().filter_map(|i| i.healthy).peekable();
    if defined.peek().is_none() {
        return NodeStatus::Maintain;
    }
    if defined.all(|healthy| healthy) {
        NodeStatus::Online
    } else {
        NodeStatus::Offline
    }
}
