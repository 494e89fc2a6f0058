//! ocmirror
//! ========
//!
//! Incremental mirroring of container image sets into disconnected registries.
//!
//! A mirror-to-disk run ([mirror::MirrorOptions::create]) resolves the releases to download,
//! records how each image is composed in an [image::AssociationSet],
//! and packs everything into an archive together with the [metadata::Metadata] log.
//! A publish run ([mirror::MirrorOptions::publish]) checks the metadata sequence against the destination,
//! reconciles blobs missing from the archive, pushes the images and commits the metadata.

pub mod archive;
pub mod cincinnati;
pub mod config;
pub mod distribution;
pub mod error;
pub mod image;
pub mod metadata;
pub mod mirror;
pub mod reconcile;
pub mod release;

mod context;
mod digest;
mod logging;

pub use context::Context;
pub use digest::Digest;
pub use logging::Logger;
