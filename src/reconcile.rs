//! Complete the blobs of an image set which were left out of the archive
//!
//! An image set only archives blobs not mirrored by a past run. Such blobs already exist in the
//! destination registry, under the namespace recorded in the metadata blob provenance, and are
//! fetched back from there so that every image can be pushed from a complete local tree.

use crate::{
    archive::{member_path, ArchiveIndex},
    config::{BLOB_DIR, MANIFEST_DIR, V2_DIR},
    distribution::{Client, Tls},
    error::*,
    image::{AssociationSet, ImageReference},
    metadata::Blob,
    Context, Digest, Logger,
};
use std::{
    collections::BTreeMap,
    fs,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Get a blob from a registry
pub trait BlobFetcher {
    fn fetch(
        &mut self,
        ctx: &Context,
        image: &ImageReference,
        tls: Tls,
        digest: &Digest,
    ) -> Result<Box<dyn ReadSeek>>;
}

/// [BlobFetcher] using the distribution client, one client per repository
#[derive(Default)]
pub struct RegistryBlobFetcher {
    clients: BTreeMap<String, Client>,
}

impl RegistryBlobFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobFetcher for RegistryBlobFetcher {
    fn fetch(
        &mut self,
        ctx: &Context,
        image: &ImageReference,
        tls: Tls,
        digest: &Digest,
    ) -> Result<Box<dyn ReadSeek>> {
        let key = format!("{}/{}", image.registry, image.path());
        let client = match self.clients.entry(key) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(Client::from_image_reference(image, tls)?)
            }
        };
        let blob = client.get_blob(ctx, digest)?;
        Ok(Box::new(io::Cursor::new(blob)))
    }
}

/// Unpack images of an image set, fetching blobs missing from the archive
pub struct Reconciler<'a> {
    index: &'a ArchiveIndex,
    provenance: &'a [Blob],
    mirror_root: String,
    tls: Tls,
    fetcher: &'a mut dyn BlobFetcher,
    logger: Logger,
}

impl<'a> Reconciler<'a> {
    /// `provenance` is the blob list of the destination metadata,
    /// and its namespaces are resolved under `mirror_root`, e.g. `localhost:5000/namespace`.
    pub fn new(
        index: &'a ArchiveIndex,
        provenance: &'a [Blob],
        mirror_root: &str,
        tls: Tls,
        fetcher: &'a mut dyn BlobFetcher,
        logger: Logger,
    ) -> Self {
        Reconciler {
            index,
            provenance,
            mirror_root: mirror_root.to_string(),
            tls,
            fetcher,
            logger,
        }
    }

    /// Unpack manifests and blobs of the image `key` into `dest/v2/`.
    ///
    /// Errors are collected over the whole image, and only cancellation stops early.
    pub fn reconcile(
        &mut self,
        ctx: &Context,
        assocs: &AssociationSet,
        key: &str,
        dest: &Path,
    ) -> Result<()> {
        let values = assocs
            .search(key)
            .ok_or_else(|| Error::MissingAssociationKey(key.to_string()))?;
        let mut errs = Vec::new();
        let mut missing: BTreeMap<Digest, Vec<PathBuf>> = BTreeMap::new();

        for assoc in values.values() {
            ctx.check()?;
            self.logger.debug(format!("reading assoc: {}", assoc.name));
            let repo_path = match member_path(Path::new(&assoc.path)) {
                Ok(path) => path,
                Err(e) => {
                    errs.push(e);
                    continue;
                }
            };
            let manifest_dir = Path::new(V2_DIR).join(&repo_path).join(MANIFEST_DIR);

            for child in assoc.manifests() {
                if !assocs.contains_key(key, child) {
                    errs.push(Error::MissingManifest {
                        image: key.to_string(),
                        digest: child.clone(),
                    });
                    continue;
                }
                if let Err(e) = self.index.unpack(&manifest_dir.join(child.to_string()), dest) {
                    errs.push(e);
                }
            }

            if let Err(e) = self.index.unpack(&manifest_dir.join(assoc.id.to_string()), dest) {
                errs.push(e);
                continue;
            }
            if let Some(tag) = &assoc.tag_symlink {
                if let Err(e) = self.index.unpack(&manifest_dir.join(tag), dest) {
                    errs.push(e);
                    continue;
                }
            }

            let image_dir = dest.join(V2_DIR).join(&repo_path);
            for layer in assoc.layers() {
                let blob = Path::new(BLOB_DIR).join(layer.to_string());
                match self.index.unpack(&blob, &image_dir) {
                    Ok(()) => {
                        self.logger
                            .debug(format!("Blob {} found in {}", layer, assoc.path));
                    }
                    Err(Error::ArchiveFileNotFound(_)) => {
                        missing
                            .entry(layer.clone())
                            .or_default()
                            .push(image_dir.join(&blob));
                    }
                    Err(e) => errs.push(e),
                }
            }
        }

        if !missing.is_empty() {
            if let Err(e) = self.fetch_blobs(ctx, missing) {
                errs.push(e);
            }
        }
        Error::aggregate(errs)
    }

    /// Fetch each missing blob once, and copy it to every path requiring it
    fn fetch_blobs(&mut self, ctx: &Context, missing: BTreeMap<Digest, Vec<PathBuf>>) -> Result<()> {
        let mut errs = Vec::new();
        for (digest, paths) in missing {
            ctx.check()?;
            let blob = match self.provenance.iter().find(|blob| blob.id == digest) {
                Some(blob) => blob,
                None => {
                    errs.push(Error::MissingBlobProvenance(digest));
                    continue;
                }
            };
            let result = ImageReference::under(&self.mirror_root, &blob.namespace_name)
                .and_then(|image| self.fetch_blob(ctx, &image, &digest, &paths));
            if let Err(e) = result {
                self.logger.error(format!("layer {}: {}", digest, e));
                errs.push(e);
            }
        }
        Error::aggregate(errs)
    }

    fn fetch_blob(
        &mut self,
        ctx: &Context,
        image: &ImageReference,
        digest: &Digest,
        paths: &[PathBuf],
    ) -> Result<()> {
        self.logger
            .debug(format!("copying blob {} from {}", digest, image.exact()));
        let mut stream = self.fetcher.fetch(ctx, image, self.tls, digest)?;
        digest.verify_reader(&mut stream)?;
        for path in paths {
            ctx.check()?;
            stream.seek(SeekFrom::Start(0))?;
            copy_blob_file(&mut stream, path)?;
        }
        Ok(())
    }
}

fn copy_blob_file(src: &mut dyn ReadSeek, path: &Path) -> Result<()> {
    log::debug!("copying blob to {}", path.display());
    let parent = path
        .parent()
        .ok_or_else(|| Error::NotAFile(path.to_owned()))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    io::copy(src, &mut tmp)?;
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        archive::{read_image_set, ArchiveWriter},
        image::{Association, ImageType, Node},
    };

    /// Serves blobs from memory and counts requests
    #[derive(Default)]
    struct FakeFetcher {
        blobs: BTreeMap<Digest, Vec<u8>>,
        requests: Vec<(String, Digest)>,
    }

    impl BlobFetcher for FakeFetcher {
        fn fetch(
            &mut self,
            _ctx: &Context,
            image: &ImageReference,
            _tls: Tls,
            digest: &Digest,
        ) -> Result<Box<dyn ReadSeek>> {
            self.requests.push((image.exact(), digest.clone()));
            let blob = self
                .blobs
                .get(digest)
                .cloned()
                .ok_or_else(|| Error::NotFound(digest.to_string()))?;
            Ok(Box::new(io::Cursor::new(blob)))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        assocs: AssociationSet,
        archived: Digest,
        remote: Digest,
    }

    /// Two images sharing a blob which is not archived
    fn fixture() -> Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_owned();
        let archived = Digest::from_buf_sha256(b"archived");
        let remote = Digest::from_buf_sha256(b"remote");

        let mut assocs = AssociationSet::new();
        let mut w = ArchiveWriter::new(&root.join("archive"), "mirror_seq2", None)?;
        w.append_data(
            &Path::new("blobs").join(archived.to_string()),
            b"archived",
        )?;
        for path in ["ubi8/ubi", "ubi8/minimal"] {
            let manifest = format!("manifest of {}", path);
            let id = Digest::from_buf_sha256(manifest.as_bytes());
            w.append_data(
                &Path::new("v2")
                    .join(path)
                    .join("manifests")
                    .join(id.to_string()),
                manifest.as_bytes(),
            )?;
            assocs.add(
                "images",
                Association {
                    name: format!("quay.io/{}:latest", path),
                    path: path.to_string(),
                    id,
                    tag_symlink: None,
                    image_type: ImageType::Generic,
                    node: Node::Layers(vec![archived.clone(), remote.clone()]),
                },
            );
        }
        w.finish()?;
        Ok(Fixture {
            _dir: dir,
            root,
            assocs,
            archived,
            remote,
        })
    }

    #[test]
    fn fetch_missing_once() -> Result<()> {
        let f = fixture()?;
        let ctx = Context::new();
        let index = read_image_set(&f.root.join("archive"))?;
        let provenance = vec![Blob {
            id: f.remote.clone(),
            namespace_name: "ubi8/ubi".to_string(),
        }];
        let mut fetcher = FakeFetcher::default();
        fetcher.blobs.insert(f.remote.clone(), b"remote".to_vec());

        let dest = f.root.join("unpack");
        for _ in 0..2 {
            let mut reconciler = Reconciler::new(
                &index,
                &provenance,
                "localhost:5000/mirror",
                Tls::Disabled,
                &mut fetcher,
                Logger::default(),
            );
            reconciler.reconcile(&ctx, &f.assocs, "images", &dest)?;
        }
        // Second run finds everything in place
        assert_eq!(
            fetcher.requests,
            vec![(
                "localhost:5000/mirror/ubi8/ubi".to_string(),
                f.remote.clone()
            )]
        );
        for path in ["ubi8/ubi", "ubi8/minimal"] {
            let blobs = dest.join("v2").join(path).join("blobs");
            assert_eq!(fs::read(blobs.join(f.remote.to_string()))?, b"remote");
            assert_eq!(fs::read(blobs.join(f.archived.to_string()))?, b"archived");
        }
        Ok(())
    }

    #[test]
    fn missing_provenance() -> Result<()> {
        let f = fixture()?;
        let ctx = Context::new();
        let index = read_image_set(&f.root.join("archive"))?;
        let mut fetcher = FakeFetcher::default();
        let mut reconciler = Reconciler::new(
            &index,
            &[],
            "localhost:5000",
            Tls::Disabled,
            &mut fetcher,
            Logger::default(),
        );
        let dest = f.root.join("unpack");
        match reconciler.reconcile(&ctx, &f.assocs, "images", &dest) {
            Err(Error::MissingBlobProvenance(digest)) => assert_eq!(digest, f.remote),
            other => panic!("unexpected: {:?}", other),
        }
        // Archived content is unpacked anyway
        assert!(dest
            .join("v2/ubi8/ubi/blobs")
            .join(f.archived.to_string())
            .is_file());
        assert!(matches!(
            reconciler.reconcile(&ctx, &f.assocs, "unknown", &dest),
            Err(Error::MissingAssociationKey(_))
        ));
        Ok(())
    }

    #[test]
    fn corrupted_blob() -> Result<()> {
        let f = fixture()?;
        let ctx = Context::new();
        let index = read_image_set(&f.root.join("archive"))?;
        let provenance = vec![Blob {
            id: f.remote.clone(),
            namespace_name: "ubi8/ubi".to_string(),
        }];
        let mut fetcher = FakeFetcher::default();
        fetcher.blobs.insert(f.remote.clone(), b"corrupted".to_vec());
        let mut reconciler = Reconciler::new(
            &index,
            &provenance,
            "localhost:5000",
            Tls::Disabled,
            &mut fetcher,
            Logger::default(),
        );
        let dest = f.root.join("unpack");
        assert!(matches!(
            reconciler.reconcile(&ctx, &f.assocs, "images", &dest),
            Err(Error::DigestMismatch { .. })
        ));
        assert!(!dest
            .join("v2/ubi8/ubi/blobs")
            .join(f.remote.to_string())
            .exists());
        Ok(())
    }

    #[test]
    fn image_path_outside_destination() -> Result<()> {
        let mut f = fixture()?;
        let ctx = Context::new();
        let index = read_image_set(&f.root.join("archive"))?;
        f.assocs.add(
            "images",
            Association {
                name: "quay.io/escaped:latest".to_string(),
                path: "../../escaped".to_string(),
                id: Digest::from_buf_sha256(b"escaped"),
                tag_symlink: None,
                image_type: ImageType::Generic,
                node: Node::Layers(vec![f.remote.clone()]),
            },
        );
        let provenance = vec![Blob {
            id: f.remote.clone(),
            namespace_name: "ubi8/ubi".to_string(),
        }];
        let mut fetcher = FakeFetcher::default();
        fetcher.blobs.insert(f.remote.clone(), b"remote".to_vec());
        let mut reconciler = Reconciler::new(
            &index,
            &provenance,
            "localhost:5000",
            Tls::Disabled,
            &mut fetcher,
            Logger::default(),
        );
        let dest = f.root.join("unpack");
        assert!(matches!(
            reconciler.reconcile(&ctx, &f.assocs, "images", &dest),
            Err(Error::UnsafeArchivePath(_))
        ));
        assert!(!f.root.join("escaped").exists());
        // Other images are complete
        assert!(dest
            .join("v2/ubi8/minimal/blobs")
            .join(f.remote.to_string())
            .is_file());
        Ok(())
    }
}
