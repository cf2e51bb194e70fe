use crate::types::{BundleId, BundleVid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one revision of a bundle, as declared in the `[identity]`
/// section of `bundle.toml`.
///
/// `id` is shared by every revision of the same dataset; the versioned id
/// (`vid`) appends the zero-padded revision so two revisions never collide in
/// a library.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BundleIdentity {
    pub id: BundleId,
    pub source: String,
    pub dataset: String,
    pub revision: u32,
    /// Time component of the bundle name, e.g. `2010-2012`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub btime: Option<String>,
    /// Space component of the bundle name, e.g. `california`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bspace: Option<String>,
}

impl BundleIdentity {
    pub fn new(id: &str, source: &str, dataset: &str, revision: u32) -> Self {
        Self {
            id: BundleId::new(id),
            source: source.to_owned(),
            dataset: dataset.to_owned(),
            revision,
            btime: None,
            bspace: None,
        }
    }

    pub fn vid(&self) -> BundleVid {
        BundleVid::new(format!("{}{:03}", self.id, self.revision))
    }

    /// Unversioned name: `source-dataset[-bspace][-btime]`.
    pub fn name(&self) -> String {
        let mut parts = vec![self.source.as_str(), self.dataset.as_str()];
        if let Some(space) = self.bspace.as_deref() {
            parts.push(space);
        }
        if let Some(time) = self.btime.as_deref() {
            parts.push(time);
        }
        parts.join("-")
    }

    pub fn vname(&self) -> String {
        format!("{}-r{}", self.name(), self.revision)
    }
}

impl fmt::Display for BundleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.vname(), self.vid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vid_pads_revision() {
        let ident = BundleIdentity::new("d00a", "example.com", "simple", 3);
        assert_eq!(ident.vid(), "d00a003");
    }

    #[test]
    fn name_includes_optional_components() {
        let mut ident = BundleIdentity::new("d00a", "example.com", "simple", 1);
        assert_eq!(ident.name(), "example.com-simple");

        ident.bspace = Some("california".to_owned());
        ident.btime = Some("2010".to_owned());
        assert_eq!(ident.name(), "example.com-simple-california-2010");
        assert_eq!(ident.vname(), "example.com-simple-california-2010-r1");
    }

    #[test]
    fn display_shows_vname_and_vid() {
        let ident = BundleIdentity::new("d00b", "cde.ca.gov", "schools", 12);
        assert_eq!(ident.to_string(), "cde.ca.gov-schools-r12 (d00b012)");
    }
}
