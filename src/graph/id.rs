//! Identity types for the filter graph.
//!
//! Node ids are stable across save/load; they are assigned once and never
//! reused within a graph.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a node in a [`FilterGraph`](super::FilterGraph)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const INVALID: NodeId = NodeId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "NodeId(INVALID)")
        } else {
            write!(f, "NodeId({})", self.0)
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One output stream of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamRef {
    pub node: NodeId,
    pub stream: usize,
}

impl StreamRef {
    pub fn new(node: NodeId, stream: usize) -> Self {
        Self { node, stream }
    }
}

impl fmt::Display for StreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node.0, self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId(7).to_string(), "NodeId(7)");
        assert_eq!(format!("{:?}", NodeId::INVALID), "NodeId(INVALID)");
        assert!(!NodeId::INVALID.is_valid());
    }

    #[test]
    fn test_stream_ref_serializes_plain() {
        let r = StreamRef::new(NodeId(3), 1);
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"node":3,"stream":1}"#);
        assert_eq!(r.to_string(), "3:1");
    }
}
