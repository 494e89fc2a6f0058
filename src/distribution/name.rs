use crate::error::*;
use regex::Regex;
use std::{fmt, str::FromStr};

/// Many registries reject `host/name` longer than this
pub const MAX_NAME_LENGTH: usize = 255;

/// Repository path in a registry, e.g. `mirror/openshift/release`
///
/// Each `/`-separated component matches
///
/// ```regex
/// [a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(String);

lazy_static::lazy_static! {
    static ref COMPONENT_RE: Regex = Regex::new(r"^[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*$").unwrap();
}

impl Name {
    pub fn new(name: &str) -> Result<Self> {
        let err = || Error::InvalidName(name.to_string());
        if name.is_empty() || name.len() > MAX_NAME_LENGTH {
            return Err(err());
        }
        if !name.split('/').all(|c| COMPONENT_RE.is_match(c)) {
            return Err(err());
        }
        Ok(Name(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last component, the image name without namespace
    pub fn base(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl std::ops::Deref for Name {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Name {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Name::new(s)
    }
}
