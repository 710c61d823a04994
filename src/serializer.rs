//! Pluggable serialization for protocol messages and resource commands.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// Wire serializer used for protocol messages and resource commands.
///
/// The default is the binary serializer; JSON is available where a
/// human-readable encoding is preferred for a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Serializer {
    #[default]
    Bincode,
    Json,
}

impl Serializer {
    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Serializer::Bincode => Ok(bincode::serialize(value)?),
            Serializer::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Serializer::Bincode => bincode::deserialize(bytes)
                .map_err(|e| TesseraError::Deserialization(e.to_string())),
            Serializer::Json => serde_json::from_slice(bytes)
                .map_err(|e| TesseraError::Deserialization(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemberInfo, MemberType};

    #[test]
    fn test_bincode_roundtrip() {
        let info = MemberInfo::new("tcp://test-1", MemberType::Active);
        let serializer = Serializer::Bincode;
        let bytes = serializer.serialize(&info).unwrap();
        let back: MemberInfo = serializer.deserialize(&bytes).unwrap();
        assert_eq!(info, back);
    }

    #[test]
    fn test_json_roundtrip() {
        let info = MemberInfo::new("tcp://test-2", MemberType::Passive);
        let serializer = Serializer::Json;
        let bytes = serializer.serialize(&info).unwrap();
        assert!(std::str::from_utf8(&bytes).is_ok());
        let back: MemberInfo = serializer.deserialize(&bytes).unwrap();
        assert_eq!(info, back);
    }

    #[test]
    fn test_deserialize_garbage_fails() {
        let serializer = Serializer::Bincode;
        let result: Result<MemberInfo> = serializer.deserialize(&[0xff, 0x01]);
        assert!(matches!(result, Err(TesseraError::Deserialization(_))));
    }
}
