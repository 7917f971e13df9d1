//! # cirrus-id
//!
//! Typed identifiers for the cloud resources cirrus provisions.
//!
//! ## Design Principles
//!
//! - IDs are issued by the provider; cirrus never invents them for real resources
//! - All IDs are parsed strictly once at the API boundary
//! - IDs are typed so an address ID cannot be passed where an instance ID is expected
//!
//! ## ID Format
//!
//! Provider IDs use a prefixed format: `{prefix}-{suffix}`
//!
//! Examples:
//! - `ins-2x8k4d1q` (instance)
//! - `eip-m44ku5gm` (floating address)
//! - `vpc-kd7d06of` (private network)
//!
//! Async task IDs are plain integers and are modelled by [`TaskId`].

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

/// Length of suffixes minted by `generate()`.
const GENERATED_SUFFIX_LEN: usize = 8;

/// Produce a random lowercase suffix from the randomness bits of a ULID.
#[doc(hidden)]
pub fn random_suffix() -> String {
    let ulid = Ulid::new().to_string().to_ascii_lowercase();
    ulid[ulid.len() - GENERATED_SUFFIX_LEN..].to_string()
}

/// Check that an ID suffix is a non-empty run of lowercase ASCII alphanumerics.
#[doc(hidden)]
pub fn validate_suffix(suffix: &str) -> Result<(), IdError> {
    let valid = !suffix.is_empty()
        && suffix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());

    if valid {
        Ok(())
    } else {
        Err(IdError::InvalidSuffix(suffix.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_random_suffix_shape() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), GENERATED_SUFFIX_LEN);
        assert!(validate_suffix(&suffix).is_ok());
    }

    proptest! {
        #[test]
        fn prop_valid_ids_roundtrip(suffix in "[a-z0-9]{1,16}") {
            let raw = format!("ins-{suffix}");
            let id: InstanceId = raw.parse().unwrap();
            prop_assert_eq!(id.as_str(), raw.as_str());
            prop_assert_eq!(id.suffix(), suffix.as_str());
        }

        #[test]
        fn prop_foreign_prefix_rejected(suffix in "[a-z0-9]{1,16}") {
            let raw = format!("eip-{suffix}");
            prop_assert!(raw.parse::<InstanceId>().unwrap_err().is_prefix_error());
        }
    }
}
