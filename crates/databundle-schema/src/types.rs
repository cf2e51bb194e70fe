//! Newtype wrappers for bundle and partition identifiers.
//!
//! All newtypes serialize as plain strings so persisted records stay readable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

id_newtype!(
    /// Unversioned dataset identifier, stable across revisions of a bundle.
    BundleId
);

id_newtype!(
    /// Versioned identifier: the [`BundleId`] followed by a three-digit revision.
    BundleVid
);

id_newtype!(
    /// Versioned identifier of a single partition.
    PartitionVid
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_id_display_and_deref() {
        let id = BundleId::new("d00a");
        assert_eq!(id.to_string(), "d00a");
        assert_eq!(id.len(), 4);
        assert_eq!(id, "d00a");
    }

    #[test]
    fn vid_serializes_as_plain_string() {
        let vid = BundleVid::new("d00a003");
        let json = serde_json::to_string(&vid).unwrap();
        assert_eq!(json, "\"d00a003\"");
        let back: BundleVid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vid);
    }

    #[test]
    fn partition_vid_ordering() {
        let a = PartitionVid::from("p001");
        let b = PartitionVid::from("p002");
        assert!(a < b);
        assert_eq!(b.into_inner(), "p002");
    }
}
