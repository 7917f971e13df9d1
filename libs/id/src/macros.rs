//! Macros for defining typed provider ID types.

/// Macro to define a typed provider ID with a specific prefix.
///
/// Provider-issued IDs have the shape `{prefix}-{suffix}`, where the suffix
/// is a non-empty run of lowercase ASCII letters and digits. The generated
/// newtype wraps the validated string and provides:
/// - A `PREFIX` constant
/// - `generate()` to mint a fresh ID (used by in-memory providers)
/// - `parse()` to parse from string
/// - `Display`, `FromStr`, `Serialize` and `Deserialize` implementations
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_id!(InstanceId, "ins");
///
/// let id: InstanceId = "ins-2x8k4d1q".parse()?;
/// assert_eq!(id.suffix(), "2x8k4d1q");
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// A typed provider ID for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Mints a new ID with a random suffix.
            ///
            /// Real IDs are always issued by the provider; this exists for
            /// in-memory providers and tests.
            #[must_use]
            pub fn generate() -> Self {
                Self(format!("{}-{}", Self::PREFIX, $crate::random_suffix()))
            }

            /// Parses an ID from a string.
            ///
            /// The string must be in the format `{prefix}-{suffix}`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let Some((prefix, suffix)) = s.split_once('-') else {
                    return Err($crate::IdError::MissingSeparator);
                };

                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                $crate::validate_suffix(suffix)?;

                Ok(Self(s.to_string()))
            }

            /// Returns the full ID string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns the portion after the prefix separator.
            #[must_use]
            pub fn suffix(&self) -> &str {
                &self.0[Self::PREFIX.len() + 1..]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}
