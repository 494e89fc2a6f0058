//! Drive mirroring runs
//!
//! - [MirrorOptions::create] runs a mirror-to-disk and packs the image set archive
//! - [MirrorOptions::publish] pushes an image set archive to the destination registry,
//!   and writes the [results](write_results) a cluster needs to pull from it
//!
//! Copying images from or to a registry is delegated to the primitives defined here,
//! so that the runs can be driven by other implementations, e.g. in tests.

mod create;
mod publish;
mod pusher;
mod release;
mod results;

pub use pusher::RegistryPusher;
pub use release::RegistryReleaseMirrorer;
pub use results::*;

use crate::{
    config::{Image, StorageConfig},
    distribution::{Client, Tls},
    error::*,
    image::{ImageReference, TypedImageMapping},
    metadata::UidPolicy,
    release::Download,
    Context, Logger,
};
use std::path::{Path, PathBuf};

/// Runtime options of a mirroring run
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    /// Workspace root
    pub dir: PathBuf,
    /// Image set archive, or a directory of archive parts
    pub from: PathBuf,
    /// Destination registry root, e.g. `localhost:5000` or `localhost:5000/org`
    pub to_mirror: String,
    /// Namespace prepended to every destination repository
    pub user_namespace: String,
    /// Use HTTPS to the destination without verifying its certificate
    pub dest_skip_tls: bool,
    /// Use plain HTTP to the destination
    pub dest_plain_http: bool,
    pub source_skip_tls: bool,
    pub dry_run: bool,
    /// Keep temporary workspaces on disk
    pub skip_cleanup: bool,
    pub uid_policy: UidPolicy,
    pub architectures: Vec<String>,
    /// Where created archives and unpacked charts go, a new directory under `dir` if not set
    pub output_dir: Option<PathBuf>,
    /// Maximum size of an archive part in bytes
    pub max_archive_size: Option<u64>,
    /// Storage of the destination metadata.
    ///
    /// If not set, metadata is stored in the destination registry as
    /// `<to_mirror>/<user_namespace>/oc-mirror:<uid>`.
    pub metadata_storage: Option<StorageConfig>,
    pub logger: Logger,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        MirrorOptions {
            dir: PathBuf::from("."),
            from: PathBuf::new(),
            to_mirror: String::new(),
            user_namespace: String::new(),
            dest_skip_tls: false,
            dest_plain_http: false,
            source_skip_tls: false,
            dry_run: false,
            skip_cleanup: false,
            uid_policy: UidPolicy::default(),
            architectures: vec!["amd64".to_string()],
            output_dir: None,
            max_archive_size: None,
            metadata_storage: None,
            logger: Logger::default(),
        }
    }
}

impl MirrorOptions {
    /// Transport security toward the destination registry
    pub fn dest_tls(&self) -> Tls {
        Tls::new(self.dest_plain_http, self.dest_skip_tls)
    }

    /// Transport security toward source registries
    pub fn source_tls(&self) -> Tls {
        Tls::new(false, self.source_skip_tls)
    }

    /// `<to_mirror>/<user_namespace>`
    pub fn mirror_root(&self) -> String {
        let root = self.to_mirror.trim_end_matches('/');
        let namespace = self.user_namespace.trim_matches('/');
        if namespace.is_empty() {
            root.to_string()
        } else {
            format!("{}/{}", root, namespace)
        }
    }

    fn output_dir(&self) -> PathBuf {
        match &self.output_dir {
            Some(dir) => dir.clone(),
            None => self
                .dir
                .join(format!("results-{}", chrono::Utc::now().timestamp())),
        }
    }
}

/// Options passed to [ImagePusher]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityOptions {
    pub tls: Tls,
    pub dry_run: bool,
}

/// An image to be copied from a local tree to a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Name in associations
    pub name: String,
    /// `file://` reference whose manifests and blobs are under `<from_dir>/v2/<path>`
    pub source: ImageReference,
    pub destination: ImageReference,
}

/// Push images from a local tree to a registry
pub trait ImagePusher {
    /// Mappings are pushed in order, so children of an index must come before it.
    fn push(
        &mut self,
        ctx: &Context,
        mappings: &[Mapping],
        from_dir: &Path,
        opts: &SecurityOptions,
    ) -> Result<()>;
}

/// Images written to disk for a release
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseContent {
    /// Release image reference, pinned by digest
    pub release: String,
    /// Source to `file://` destination of every image in the release
    pub mapping: TypedImageMapping,
    /// Source images in the release, including the release image
    pub images: Vec<String>,
}

/// Mirror a release to disk, writing manifests and blobs under `<to_dir>/v2/`
pub trait ReleaseMirrorer {
    fn mirror(
        &mut self,
        ctx: &Context,
        download: &Download,
        to_dir: &Path,
        dry_run: bool,
    ) -> Result<ReleaseContent>;
}

/// Rebuild catalog images from the unpacked image set
pub trait CatalogRebuilder {
    /// `workspace` is the root where the image set is unpacked, catalogs are in `catalogs/`.
    /// Returns the catalog images pushed under `mirror_root`.
    fn rebuild(
        &mut self,
        ctx: &Context,
        workspace: &Path,
        mirror_root: &str,
    ) -> Result<TypedImageMapping>;
}

/// Whether the image is blocked by the configuration.
///
/// Blocked images are matched by name only, so `alpine` blocks `docker.io/library/alpine`
/// and also `quay.io/other/alpine`.
pub fn is_blocked(blocked: &[Image], image: &ImageReference) -> bool {
    blocked.iter().any(|block| {
        log::debug!("Checking if image {} is blocked", image.exact());
        block.name == image.name
    })
}

/// Resolve a tag of the image into a reference pinned by digest
pub fn pin_image(ctx: &Context, image: &ImageReference, tls: Tls) -> Result<String> {
    if image.is_pinned() {
        return Ok(image.exact());
    }
    let mut client = Client::from_image_reference(image, tls)?;
    let digest = client.get_manifest_digest(ctx, &image.manifest_reference())?;
    let mut pinned = image.clone();
    pinned.tag = None;
    pinned.id = Some(digest);
    Ok(pinned.exact())
}
