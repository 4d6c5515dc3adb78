//! Per-window trigger state.
//!
//! The state is a flat vector with one entry per node of the compiled
//! trigger plan, in pre-order. Keeping it flat (rather than a tree of boxed
//! children) lets it derive rkyv directly and makes resetting a subtree a
//! slice operation.

use rkyv::{
    rancor::Error as RkyvError, Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize,
};

use crate::state::StateError;

/// Data carried by a single trigger node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub enum NodeData {
    /// The node keeps no data beyond its finished flag.
    None,
    /// Elements seen since the last reset.
    Count(u64),
    /// Processing-time deadline, set by the first element after a reset.
    Deadline(Option<i64>),
    /// Whether the end-of-window firing has happened.
    PastEnd(bool),
}

/// State of one trigger node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct NodeState {
    /// True once the node can no longer fire
    pub finished: bool,
    /// Node-specific data
    pub data: NodeData,
}

impl NodeState {
    pub(crate) fn new(data: NodeData) -> Self {
        Self {
            finished: false,
            data,
        }
    }
}

/// Trigger state for one (key, window).
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct TriggerState {
    pub(crate) nodes: Vec<NodeState>,
}

impl TriggerState {
    pub(crate) fn from_nodes(nodes: Vec<NodeState>) -> Self {
        Self { nodes }
    }

    /// Returns true if the root trigger has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.nodes.first().is_some_and(|node| node.finished)
    }

    /// Returns the state of every node in plan order.
    #[must_use]
    pub fn nodes(&self) -> &[NodeState] {
        &self.nodes
    }

    /// Serializes the state for a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Serialization`] if rkyv serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StateError> {
        rkyv::to_bytes::<RkyvError>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| StateError::Serialization(e.to_string()))
    }

    /// Restores state written by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Deserialization`] if the bytes are not a valid
    /// archived trigger state.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        let mut aligned = rkyv::util::AlignedVec::<16>::new();
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, RkyvError>(&aligned)
            .map_err(|e| StateError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_bytes_roundtrip() {
        let mut state = TriggerState::from_nodes(vec![
            NodeState::new(NodeData::None),
            NodeState::new(NodeData::Count(3)),
            NodeState::new(NodeData::Deadline(Some(1500))),
            NodeState::new(NodeData::PastEnd(true)),
        ]);
        state.nodes[1].finished = true;

        let bytes = state.to_bytes().unwrap();
        let restored = TriggerState::from_bytes(&bytes).unwrap();
        assert_eq!(restored, state);
        assert!(!restored.is_finished());
    }

    #[test]
    fn test_state_from_garbage() {
        assert!(matches!(
            TriggerState::from_bytes(&[1, 2, 3]),
            Err(StateError::Deserialization(_))
        ));
    }
}
