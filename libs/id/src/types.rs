//! Typed ID definitions for provisioning runs and the remote resources they touch.

use crate::{define_opaque_id, define_ulid_id};

// =============================================================================
// Locally minted
// =============================================================================

define_ulid_id!(RunId, "run");

// =============================================================================
// Compute provider
// =============================================================================

define_opaque_id!(InstanceId);

// =============================================================================
// Job-dispatch platform
// =============================================================================

/// Runner registration ID assigned by the job-dispatch platform.
///
/// The platform uses plain integers, so this is not a prefixed string ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunnerId(u64);

impl RunnerId {
    /// Creates a RunnerId from the platform's numeric id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying numeric value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RunnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunnerId {
    type Err = crate::IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(crate::IdError::Empty);
        }
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| crate::IdError::InvalidNumber(s.to_string()))
    }
}

impl From<u64> for RunnerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for RunnerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for RunnerId {
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
    fn test_run_id_roundtrip() {
        let id = RunId::new();
        let s = id.to_string();
        let parsed: RunId = s.parse().unwrap();
        assert_eq!(id, parsed);
        assert!(s.starts_with("run_"));
    }

    #[test]
    fn test_run_id_invalid_prefix() {
        let result: Result<RunId, _> = "job_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_run_id_missing_separator() {
        let result: Result<RunId, _> = "run01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_run_id_invalid_ulid() {
        let result: Result<RunId, _> = "run_invalid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_instance_id_opaque() {
        let id: InstanceId = "i-0abc123def4567890".parse().unwrap();
        assert_eq!(id.as_str(), "i-0abc123def4567890");

        let empty: Result<InstanceId, _> = "".parse();
        assert!(empty.unwrap_err().is_empty());
    }

    #[test]
    fn test_instance_id_json_is_plain_string() {
        let id = InstanceId::parse("i-123").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"i-123\"");
    }

    #[test]
    fn test_runner_id_json_roundtrip() {
        let id = RunnerId::new(4242);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "4242");
        let parsed: RunnerId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_runner_id_rejects_garbage() {
        assert!(matches!(
            "abc".parse::<RunnerId>().unwrap_err(),
            crate::IdError::InvalidNumber(_)
        ));
    }
}
