use serde::{Deserialize, Serialize};

/// A state mutation replicated through the consensus log.
///
/// Wire form: `{"action":"set","key":..,"value":..}` or `{"action":"delete","key":..}`.
/// The encoding is shared by every node of a cluster; changing it needs a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }

    pub fn encode(&self) -> Result<EncodedCommand, serde_json::Error> {
        serde_json::to_vec(self).map(EncodedCommand)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Opaque command bytes as carried by a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedCommand(pub Vec<u8>);

impl EncodedCommand {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for EncodedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn set_wire_shape() {
        let encoded = Command::set("k", "v").encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(encoded.as_bytes()).unwrap();
        assert_eq!(value, json!({"action": "set", "key": "k", "value": "v"}));
    }

    #[test]
    fn delete_carries_no_value() {
        let encoded = Command::delete("k").encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(encoded.as_bytes()).unwrap();
        assert_eq!(value, json!({"action": "delete", "key": "k"}));
    }

    #[test]
    fn decode_rejects_malformed_shapes() {
        assert!(Command::decode(br#"{"action":"set","key":"k"}"#).is_err());
        assert!(Command::decode(br#"{"action":"delete","key":"k","value":"v"}"#).is_err());
        assert!(Command::decode(br#"{"action":"rename","key":"k"}"#).is_err());
        assert!(Command::decode(b"not json").is_err());
    }

    #[test]
    fn empty_key_is_not_validated_here() {
        let cmd = Command::decode(br#"{"action":"delete","key":""}"#).unwrap();
        assert_eq!(cmd, Command::delete(""));
    }
}
