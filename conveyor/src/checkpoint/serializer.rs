//! Serializer for checkpoint state (state <-> bytes).
//!
//! Used by the persistent checkpointers; [`MemorySaver`](super::MemorySaver)
//! stores checkpoints in memory and does not serialize.

use super::checkpointer::CheckpointError;

/// Serializes and deserializes state for checkpoint storage.
///
/// The persisted format must round-trip every state field exactly, including
/// the null/absent distinction on optionals.
pub trait Serializer<S>: Send + Sync
where
    S: Clone + Send + Sync + 'static,
{
    fn serialize(&self, state: &S) -> Result<Vec<u8>, CheckpointError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<S, CheckpointError>;
}

/// JSON-based serializer. Requires `S: Serialize + DeserializeOwned`.
pub struct JsonSerializer;

impl<S> Serializer<S> for JsonSerializer
where
    S: Clone + Send + Sync + 'static + serde::Serialize + serde::de::DeserializeOwned,
{
    fn serialize(&self, state: &S) -> Result<Vec<u8>, CheckpointError> {
        serde_json::to_vec(state).map_err(|e| CheckpointError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<S, CheckpointError> {
        serde_json::from_slice(bytes).map_err(|e| CheckpointError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct TestState {
        value: String,
        missing: Option<String>,
    }

    /// **Scenario**: Serialize then deserialize yields the same value,
    /// preserving None.
    #[test]
    fn json_serializer_roundtrip() {
        let ser = JsonSerializer;
        let state = TestState {
            value: "hello".into(),
            missing: None,
        };
        let bytes = ser.serialize(&state).unwrap();
        let restored: TestState = ser.deserialize(&bytes).unwrap();
        assert_eq!(state, restored);
    }

    /// **Scenario**: Invalid JSON on deserialize returns a Serialization error.
    #[test]
    fn invalid_json_is_serialization_error() {
        let ser = JsonSerializer;
        let result: Result<TestState, _> = ser.deserialize(b"{ not valid json ]");
        match result {
            Err(CheckpointError::Serialization(msg)) => assert!(!msg.is_empty()),
            other => panic!("expected Serialization error, got {other:?}"),
        }
    }
}
