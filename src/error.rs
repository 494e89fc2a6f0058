use crate::Digest;
use oci_spec::{distribution::ErrorResponse, OciSpecError};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    //
    // Invalid user input
    //
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
    #[error("Invalid name for repository: {0}")]
    InvalidName(String),
    #[error("Invalid reference to image: {0}")]
    InvalidReference(String),
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
    #[error(transparent)]
    InvalidVersion(#[from] semver::Error),
    #[error("Invalid image type: {0}")]
    InvalidImageType(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Not a file, or not exist: {0}")]
    NotAFile(PathBuf),
    #[error("destination {0:?} must be a registry reference")]
    NotARegistry(String),
    #[error("image {0} blocked")]
    Blocked(String),

    //
    // Metadata log
    //
    #[error("invalid bundle sequence order, want {want}, got {got}")]
    Sequence { want: u64, got: u64 },
    #[error("mismatched uuids, want {want}, got {got}")]
    Uid { want: Uuid, got: Uuid },
    #[error("metadata does not exist")]
    MetadataNotExist,
    #[error("no previous release downloads detected")]
    NoPreviousRelease,

    //
    // Invalid image set
    //
    #[error("file {0} not found in archive")]
    ArchiveFileNotFound(String),
    #[error("image {image:?}: expected associations to have manifest {digest} but was not found")]
    MissingManifest { image: String, digest: Digest },
    #[error("image {0:?} is not present in associations")]
    MissingAssociationKey(String),
    #[error("layer {0:?} is not present in previous metadata")]
    MissingBlobProvenance(Digest),
    #[error("blob digest mismatch, want {want}, got {got}")]
    DigestMismatch { want: Digest, got: Digest },
    #[error("{0} not found")]
    NotFound(String),
    #[error("archive member {0:?} escapes the destination directory")]
    UnsafeArchivePath(String),
    #[error(transparent)]
    InvalidJson(#[from] serde_json::error::Error),
    #[error(transparent)]
    InvalidToml(#[from] toml::de::Error),
    #[error(transparent)]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("Error within oci-spec: {0}")]
    OciSpec(String),

    //
    // Error from remote services
    //
    #[error(transparent)]
    NetworkError(Box<ureq::Transport>),
    #[error(transparent)]
    RegistryError(#[from] ErrorResponse),
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(url::Url),
    #[error(transparent)]
    Tls(#[from] native_tls::Error),
    #[error("Unsupported WWW-Authentication header: {0}")]
    UnSupportedAuthHeader(String),
    #[error("failed to get upgrade graph from {url}: {reason}")]
    GraphQuery { url: url::Url, reason: String },

    //
    // Run control
    //
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("{}", display_aggregate(.0))]
    Aggregate(Vec<Error>),

    //
    // System error
    //
    #[error("No valid runtime directory where authentication info will be stored.")]
    NoValidRuntimeDirectory,
    #[error(transparent)]
    UnknownIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Collapse errors collected over a batch into one.
    ///
    /// Returns `Ok(())` when nothing failed.
    pub fn aggregate(mut errs: Vec<Error>) -> Result<()> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(Error::Aggregate(errs)),
        }
    }

    /// Errors which are control signals rather than failures.
    pub fn is_not_exist(&self) -> bool {
        matches!(self, Error::MetadataNotExist | Error::NotFound(_))
    }
}

fn display_aggregate(errs: &[Error]) -> String {
    let msgs: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
    format!("[{}]", msgs.join(", "))
}

impl From<OciSpecError> for Error {
    fn from(e: OciSpecError) -> Self {
        match e {
            OciSpecError::SerDe(e) => Error::InvalidJson(e),
            OciSpecError::Io(e) => Error::UnknownIo(e),
            OciSpecError::Builder(e) => Error::OciSpec(e.to_string()),
            OciSpecError::Other(e) => Error::OciSpec(e),
        }
    }
}

impl From<walkdir::Error> for Error {
    fn from(e: walkdir::Error) -> Self {
        Self::UnknownIo(e.into())
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(e: tempfile::PersistError) -> Self {
        Self::UnknownIo(e.error)
    }
}

impl From<ureq::Error> for Error {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Status(404, res) => Error::NotFound(res.get_url().to_string()),
            ureq::Error::Status(_status, res) => match res.into_json::<ErrorResponse>() {
                Ok(err) => Error::RegistryError(err),
                Err(e) => Error::UnknownIo(e),
            },
            ureq::Error::Transport(e) => Error::NetworkError(e.into()),
        }
    }
}
