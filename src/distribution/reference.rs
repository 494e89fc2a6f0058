use crate::{error::*, Digest};
use regex::Regex;
use std::fmt;

/// Reference of container image stored in the repository,
/// used in `/v2/<name>/manifests/<reference>` endpoints.
///
/// In [OCI distribution spec](https://github.com/opencontainers/distribution-spec/blob/main/spec.md):
/// > `<reference>` as a tag MUST be at most 128 characters
/// > in length and MUST match the following regular expression:
/// > ```text
/// > [a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}
/// > ```
///
/// A digest is also accepted as a reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => write!(f, "{}", tag),
            Reference::Digest(digest) => write!(f, "{}", digest),
        }
    }
}

lazy_static::lazy_static! {
    static ref TAG_RE: Regex = Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap();
}

impl Reference {
    pub fn new(name: &str) -> Result<Self> {
        if TAG_RE.is_match(name) {
            Ok(Reference::Tag(name.to_string()))
        } else if let Ok(digest) = Digest::new(name) {
            Ok(Reference::Digest(digest))
        } else {
            Err(Error::InvalidReference(name.to_string()))
        }
    }

    pub fn is_tag(name: &str) -> bool {
        TAG_RE.is_match(name)
    }
}

impl From<Digest> for Reference {
    fn from(digest: Digest) -> Self {
        Reference::Digest(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference() {
        assert_eq!(
            Reference::new("latest").unwrap(),
            Reference::Tag("latest".to_string())
        );
        assert!(matches!(
            Reference::new("sha256:0123").unwrap(),
            Reference::Digest(_)
        ));
        // @ is not allowed
        assert!(Reference::new("my_super_tag@2").is_err());
    }
}
