//! Sequenced log of mirroring runs
//!
//! Each image set carries a [Metadata] record. The destination keeps the record of the last
//! published image set, and an incoming one is accepted only if it continues that sequence
//! (see [check_sequence]).

pub mod storage;

use crate::{config, error::*, image::ImageReference, Context, Digest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub use storage::Backend;

/// Root record of a mirroring lineage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Identity of this lineage, assigned once
    pub uid: Uuid,
    /// Metadata is not kept at the destination
    #[serde(default)]
    pub single_use: bool,
    pub past_mirror: PastMirror,
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata::new()
    }
}

impl Metadata {
    /// New lineage with no run recorded yet
    pub fn new() -> Self {
        Metadata {
            uid: Uuid::new_v4(),
            single_use: false,
            past_mirror: PastMirror::default(),
        }
    }

    /// Metadata of the next run of this lineage
    pub fn next_run(&self, mirror: config::Mirror) -> Self {
        Metadata {
            uid: self.uid,
            single_use: self.single_use,
            past_mirror: PastMirror {
                timestamp: chrono::Utc::now().timestamp(),
                sequence: self.past_mirror.sequence + 1,
                mirror,
                operators: Vec::new(),
                ocp_releases: Vec::new(),
                blobs: self.past_mirror.blobs.clone(),
            },
        }
    }
}

/// Record of the most recent run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PastMirror {
    /// Unix time of the run
    #[serde(default)]
    pub timestamp: i64,
    pub sequence: u64,
    /// Requested content, with resolved release versions
    #[serde(default)]
    pub mirror: config::Mirror,
    #[serde(default)]
    pub operators: Vec<OperatorMetadata>,
    #[serde(default)]
    pub ocp_releases: Vec<OcpMetadata>,
    /// Blob provenance, most recent first
    #[serde(default)]
    pub blobs: Vec<Blob>,
}

impl PastMirror {
    /// Record `layers` as mirrored in this run.
    ///
    /// Newly recorded blobs come first, an already known digest moves to the front.
    pub fn record_blobs<'a>(&mut self, layers: impl IntoIterator<Item = (&'a str, &'a Digest)>) {
        let mut recorded = Vec::new();
        let mut seen = BTreeSet::new();
        for (namespace_name, id) in layers {
            if seen.insert(id.clone()) {
                recorded.push(Blob {
                    id: id.clone(),
                    namespace_name: namespace_name.to_string(),
                });
            }
        }
        let past = std::mem::take(&mut self.blobs);
        recorded.extend(past.into_iter().filter(|blob| !seen.contains(&blob.id)));
        self.blobs = recorded;
    }

    /// Most recent provenance of the blob
    pub fn find_blob(&self, digest: &Digest) -> Option<&Blob> {
        self.blobs.iter().find(|blob| &blob.id == digest)
    }
}

/// Starting point of a catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorMetadata {
    pub catalog: String,
    /// Catalog reference pinned by digest
    pub image_pin: String,
}

/// Starting point of a release channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcpMetadata {
    pub release_channel: String,
    #[serde(default)]
    pub min_version: String,
}

/// Where a blob was last mirrored to, relative to the destination root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub id: Digest,
    pub namespace_name: String,
}

/// How to treat an incoming image set from another lineage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UidPolicy {
    /// Start over, the incoming image set must be the first of its lineage
    #[default]
    NewLineage,
    /// Refuse to publish
    Reject,
}

/// Check that `incoming` is the next image set after `current`
pub fn check_sequence(
    current: Option<&Metadata>,
    incoming: &Metadata,
    policy: UidPolicy,
) -> Result<()> {
    let got = incoming.past_mirror.sequence;
    let current = match current {
        Some(current) if current.uid != incoming.uid => match policy {
            UidPolicy::Reject => {
                return Err(Error::Uid {
                    want: current.uid,
                    got: incoming.uid,
                })
            }
            UidPolicy::NewLineage => {
                log::warn!(
                    "metadata uid {} does not match {}, starting new lineage",
                    incoming.uid,
                    current.uid
                );
                None
            }
        },
        current => current,
    };
    let want = match current {
        Some(current) => current.past_mirror.sequence + 1,
        None => 1,
    };
    if got != want {
        return Err(Error::Sequence { want, got });
    }
    Ok(())
}

/// Copy metadata from one backend to another
pub fn sync_metadata(ctx: &Context, first: &mut dyn Backend, second: &mut dyn Backend) -> Result<()> {
    let path = config::metadata_base_path();
    let meta = first.read_metadata(ctx, &path)?;
    second.write_metadata(ctx, &meta, &path)
}

/// Record starting points of catalogs and heads-only release channels, then write `meta`.
///
/// `resolve_pin` turns a catalog reference into one pinned by digest.
/// It is called only for catalogs not pinned yet.
pub fn update_metadata(
    ctx: &Context,
    backend: &mut dyn Backend,
    meta: &mut Metadata,
    resolve_pin: &mut dyn FnMut(&ImageReference) -> Result<String>,
) -> Result<()> {
    let path = config::metadata_base_path();
    let past_releases: BTreeMap<String, String> = match backend.read_metadata(ctx, &path) {
        Ok(past) => past
            .past_mirror
            .ocp_releases
            .into_iter()
            .map(|ch| (ch.release_channel, ch.min_version))
            .collect(),
        Err(Error::MetadataNotExist) => BTreeMap::new(),
        Err(e) => return Err(e),
    };

    let mut errs = Vec::new();
    let mut operators = Vec::new();
    for operator in &meta.past_mirror.mirror.operators {
        let pin = ImageReference::parse(&operator.catalog).and_then(|reference| {
            if reference.is_pinned() {
                Ok(operator.catalog.clone())
            } else {
                resolve_pin(&reference)
            }
        });
        match pin {
            Ok(image_pin) => operators.push(OperatorMetadata {
                catalog: operator.catalog.clone(),
                image_pin,
            }),
            Err(e) => errs.push(e),
        }
    }
    Error::aggregate(errs)?;
    meta.past_mirror.operators.extend(operators);

    for channel in &meta.past_mirror.mirror.platform.channels {
        if !channel.heads_only {
            continue;
        }
        let min_version = match past_releases.get(&channel.name) {
            Some(min) => min.clone(),
            None => {
                log::debug!(
                    "channel {:?} not found, setting new min to {:?}",
                    channel.name,
                    channel.min_version
                );
                channel.min_version.clone()
            }
        };
        meta.past_mirror.ocp_releases.push(OcpMetadata {
            release_channel: channel.name.clone(),
            min_version,
        });
    }

    backend.write_metadata(ctx, meta, &path)
}
