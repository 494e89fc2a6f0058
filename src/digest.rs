use crate::error::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::{fmt, str::FromStr};

/// Digest of contents
///
/// Digest is defined in [OCI image spec](https://github.com/opencontainers/image-spec/blob/v1.0.1/descriptor.md#digests)
/// as a string satisfies following EBNF:
///
/// ```text
/// digest                ::= algorithm ":" encoded
/// algorithm             ::= algorithm-component (algorithm-separator algorithm-component)*
/// algorithm-component   ::= [a-z0-9]+
/// algorithm-separator   ::= [+._-]
/// encoded               ::= [a-zA-Z0-9=_-]+
/// ```
///
/// Blobs and manifests are stored under the string form of the digest,
/// e.g. `blobs/sha256:0123...`, in the image set workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    pub algorithm: String,
    pub encoded: String,
}

lazy_static::lazy_static! {
    static ref ALGORITHM_RE: Regex = Regex::new(r"^[a-z0-9]+([+._-][a-z0-9]+)*$").unwrap();
    static ref ENCODED_RE: Regex = Regex::new(r"^[a-zA-Z0-9=_-]+$").unwrap();
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl FromStr for Digest {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Digest::new(s)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Digest, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::new(&s).map_err(serde::de::Error::custom)
    }
}

impl Digest {
    pub fn new(input: &str) -> Result<Self> {
        let mut iter = input.split(':');
        match (iter.next(), iter.next(), iter.next()) {
            (Some(algorithm), Some(encoded), None)
                if ALGORITHM_RE.is_match(algorithm) && ENCODED_RE.is_match(encoded) =>
            {
                Ok(Digest {
                    algorithm: algorithm.to_string(),
                    encoded: encoded.to_string(),
                })
            }
            _ => Err(Error::InvalidDigest(input.to_string())),
        }
    }

    pub fn from_descriptor(descriptor: &oci_spec::image::Descriptor) -> Result<Self> {
        Self::new(descriptor.digest())
    }

    /// Calc digest using SHA-256 algorithm
    pub fn from_buf_sha256(buf: &[u8]) -> Self {
        let hash = Sha256::digest(buf);
        let digest = base16ct::lower::encode_string(&hash);
        Self {
            algorithm: "sha256".to_string(),
            encoded: digest,
        }
    }

    /// Check that `buf` has this digest.
    ///
    /// Only `sha256` is verified, other algorithms are accepted as is.
    pub fn verify(&self, buf: &[u8]) -> Result<()> {
        if self.algorithm != "sha256" {
            log::debug!("Skip verification of {} digest", self.algorithm);
            return Ok(());
        }
        let actual = Self::from_buf_sha256(buf);
        if &actual != self {
            return Err(Error::DigestMismatch {
                want: self.clone(),
                got: actual,
            });
        }
        Ok(())
    }

    /// Same as [Digest::verify] for a stream, read to the end
    pub fn verify_reader<R: std::io::Read>(&self, reader: &mut R) -> Result<()> {
        if self.algorithm != "sha256" {
            log::debug!("Skip verification of {} digest", self.algorithm);
            return Ok(());
        }
        let mut hasher = Sha256::new();
        std::io::copy(reader, &mut hasher)?;
        let actual = Self {
            algorithm: "sha256".to_string(),
            encoded: base16ct::lower::encode_string(&hasher.finalize()),
        };
        if &actual != self {
            return Err(Error::DigestMismatch {
                want: self.clone(),
                got: actual,
            });
        }
        Ok(())
    }

    /// Leading characters of the encoded part, used as a fallback tag
    pub fn partial(&self) -> &str {
        let end = self.encoded.len().min(6);
        &self.encoded[..end]
    }
}
