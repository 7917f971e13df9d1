//! Typed ID definitions for provider resources.
//!
//! Each ID type has the prefix the provider uses when it issues IDs for
//! that resource kind.

use crate::define_id;

// =============================================================================
// Compute
// =============================================================================

define_id!(InstanceId, "ins");
define_id!(KeyPairId, "skey");

// =============================================================================
// Networking
// =============================================================================

define_id!(VpcId, "vpc");
define_id!(SubnetId, "subnet");
define_id!(SecurityGroupId, "sg");
define_id!(AddressId, "eip");

// =============================================================================
// Async Tasks
// =============================================================================

/// Task ID for an asynchronous provider mutation.
///
/// The provider returns task IDs as decimal strings; they are parsed into
/// a `u64` once at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Creates a new TaskId from a u64.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying u64 value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Parses a task ID from its decimal string form.
    pub fn parse(s: &str) -> Result<Self, crate::IdError> {
        if s.is_empty() {
            return Err(crate::IdError::Empty);
        }
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| crate::IdError::InvalidFormat {
                message: format!("task id {s:?}: {e}"),
            })
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for TaskId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for TaskId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = u64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_roundtrip() {
        let id = InstanceId::generate();
        let s = id.to_string();
        let parsed: InstanceId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_instance_id_prefix() {
        let id = InstanceId::generate();
        assert!(id.as_str().starts_with("ins-"));
        assert_eq!(id.suffix().len(), 8);
    }

    #[test]
    fn test_parse_provider_issued() {
        let id: AddressId = "eip-m44ku5gm".parse().unwrap();
        assert_eq!(id.suffix(), "m44ku5gm");
        let sg: SecurityGroupId = "sg-0a1b2c3d".parse().unwrap();
        assert_eq!(sg.as_str(), "sg-0a1b2c3d");
    }

    #[test]
    fn test_invalid_prefix() {
        let result: Result<VpcId, _> = "subnet-abc123".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<InstanceId, _> = "ins2x8k4d1q".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_empty() {
        let result: Result<InstanceId, _> = "".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_invalid_suffix() {
        let result: Result<InstanceId, _> = "ins-".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidSuffix(_)
        ));

        let result: Result<InstanceId, _> = "ins-AB_12".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidSuffix(_)
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let id = SubnetId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let parsed: SubnetId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_task_id_parse() {
        assert_eq!(TaskId::parse("1234567").unwrap().value(), 1234567);
        assert!(TaskId::parse("").is_err());
        assert!(TaskId::parse("task-1").is_err());
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = vec![
            InstanceId::PREFIX,
            KeyPairId::PREFIX,
            VpcId::PREFIX,
            SubnetId::PREFIX,
            SecurityGroupId::PREFIX,
            AddressId::PREFIX,
        ];

        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }
}
