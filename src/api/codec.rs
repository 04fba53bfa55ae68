use crate::api::RaftError;
use serde::de::DeserializeOwned;
use serde::Serialize;

// Variant order of every encoded enum is its stable wire tag. Append new variants only.

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RaftError> {
    bincode::serialize(value).map_err(|e| RaftError::Internal(format!("Serialization failure: {}", e)))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RaftError> {
    bincode::deserialize(bytes).map_err(|e| RaftError::Internal(format!("Deserialization failure: {}", e)))
}
