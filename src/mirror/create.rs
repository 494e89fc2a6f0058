use super::{is_blocked, pin_image, MirrorOptions, ReleaseMirrorer};
use crate::{
    archive::ArchiveWriter,
    cincinnati::UpdateGraph,
    config::{
        associations_base_path, metadata_base_path, ImageSetConfiguration, BLOB_DIR, HELM_DIR,
        MANIFEST_DIR, SOURCE_DIR, V2_DIR,
    },
    error::*,
    image::{associate_image_layers, AssociationSet, ImageReference, ImageType},
    metadata::{storage::by_config, storage::LocalBackend, update_metadata, Backend, Metadata},
    release::resolve_releases,
    Context, Digest,
};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

impl MirrorOptions {
    /// Mirror the content requested by `cfg` to disk and pack it as the next image set.
    ///
    /// The workspace is `<dir>/src`, and archive parts are written into the output directory.
    /// Blobs recorded by past runs are left out of the archive.
    /// Returns the written archive parts, none for a dry run.
    pub fn create(
        &self,
        ctx: &Context,
        cfg: &ImageSetConfiguration,
        graph: &mut dyn UpdateGraph,
        releases: &mut dyn ReleaseMirrorer,
    ) -> Result<Vec<PathBuf>> {
        let logger = self.logger.child("create");
        cfg.validate()?;
        let src_dir = self.dir.join(SOURCE_DIR);
        fs::create_dir_all(&src_dir)?;

        let mut backend = by_config(&src_dir, &cfg.storage_config)?;
        let last = match backend.read_metadata(ctx, &metadata_base_path()) {
            Ok(meta) => meta,
            Err(Error::MetadataNotExist) => {
                logger.info("No existing metadata found. Setting up new workspace");
                Metadata::new()
            }
            Err(e) => return Err(e),
        };
        let mut meta = last.next_run(cfg.mirror.clone());
        logger.info(format!("Creating image set sequence {}", meta.past_mirror.sequence));

        let (downloads, errs) = resolve_releases(
            ctx,
            &logger,
            graph,
            &last,
            &mut meta.past_mirror.mirror.platform.channels,
            &self.architectures,
        );
        Error::aggregate(errs)?;
        for download in downloads.iter() {
            let release = ImageReference::parse(&download.update.image)?;
            if is_blocked(&cfg.mirror.blocked_images, &release) {
                return Err(Error::Blocked(release.exact()));
            }
        }

        let mut assocs = AssociationSet::new();
        for download in downloads.iter() {
            ctx.check()?;
            logger.debug(format!(
                "Starting release download for version {}",
                download.update.version
            ));
            let content = releases.mirror(ctx, download, &src_dir, self.dry_run)?;
            if self.dry_run {
                continue;
            }
            let mut release_assocs = associate_image_layers(
                &src_dir,
                &content.mapping,
                &content.images,
                ImageType::OcpRelease,
            )?;
            // All images of a release form one key set for publishing
            for image in &content.images {
                if image != &content.release {
                    release_assocs.rekey(image, &content.release)?;
                }
            }
            assocs.merge(release_assocs);
        }
        if self.dry_run {
            logger.info(format!("Dry run, {} releases resolved", downloads.len()));
            return Ok(Vec::new());
        }

        let past_blobs: BTreeSet<Digest> = last
            .past_mirror
            .blobs
            .iter()
            .map(|blob| blob.id.clone())
            .collect();
        meta.past_mirror.record_blobs(assocs.layers());

        let tls = self.source_tls();
        update_metadata(ctx, backend.as_mut(), &mut meta, &mut |image: &ImageReference| {
            pin_image(ctx, image, tls)
        })?;
        // Image set carries its own copy of metadata
        LocalBackend::new(src_dir.clone())?.write_metadata(ctx, &meta, &metadata_base_path())?;
        assocs.write(&src_dir.join(associations_base_path()))?;
        ensure_digest_manifests(&src_dir, &assocs)?;

        let output_dir = self.output_dir();
        let prefix = format!("mirror_seq{}", meta.past_mirror.sequence);
        let mut writer = ArchiveWriter::new(&output_dir, &prefix, self.max_archive_size)?;
        pack_workspace(&mut writer, &src_dir, &past_blobs)?;
        let parts = writer.finish()?;
        logger.info(format!(
            "Wrote {} archive parts to {}",
            parts.len(),
            output_dir.display()
        ));
        Ok(parts)
    }
}

/// Store each manifest under its digest as well, since publishing reads them by digest
fn ensure_digest_manifests(src_dir: &Path, assocs: &AssociationSet) -> Result<()> {
    for (_key, values) in assocs.iter() {
        for assoc in values.values() {
            let manifest_dir = src_dir.join(V2_DIR).join(&assoc.path).join(MANIFEST_DIR);
            let by_id = manifest_dir.join(assoc.id.to_string());
            if by_id.exists() {
                continue;
            }
            let tag = assoc
                .tag_symlink
                .as_ref()
                .ok_or_else(|| Error::NotAFile(by_id.clone()))?;
            fs::copy(manifest_dir.join(tag), &by_id)?;
        }
    }
    Ok(())
}

/// Append metadata, associations, charts and the `v2/` tree of `src_dir`.
///
/// Blobs are stored once at `blobs/<digest>`, except those in `past_blobs`.
fn pack_workspace(
    writer: &mut ArchiveWriter,
    src_dir: &Path,
    past_blobs: &BTreeSet<Digest>,
) -> Result<()> {
    for member in [metadata_base_path(), associations_base_path()] {
        writer.append_file(&member, &src_dir.join(&member))?;
    }

    let charts = src_dir.join(HELM_DIR);
    if charts.is_dir() {
        for entry in walkdir::WalkDir::new(&charts).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() {
                let member = Path::new(HELM_DIR).join(relative(entry.path(), &charts)?);
                writer.append_file(&member, entry.path())?;
            }
        }
    }

    let v2 = src_dir.join(V2_DIR);
    if !v2.is_dir() {
        return Ok(());
    }
    let mut archived = BTreeSet::new();
    for entry in walkdir::WalkDir::new(&v2).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = relative(entry.path(), &v2)?;
        let in_blob_dir = rel
            .parent()
            .and_then(|parent| parent.file_name())
            .map_or(false, |dir| dir == BLOB_DIR);
        if !in_blob_dir {
            writer.append_file(&Path::new(V2_DIR).join(&rel), entry.path())?;
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let digest = Digest::new(&name)?;
        if past_blobs.contains(&digest) {
            log::debug!("blob {} is mirrored by a past run", digest);
            continue;
        }
        if archived.insert(digest) {
            writer.append_file(&Path::new(BLOB_DIR).join(&name), entry.path())?;
        }
    }
    Ok(())
}

fn relative(path: &Path, base: &Path) -> Result<PathBuf> {
    path.strip_prefix(base)
        .map(|rel| rel.to_owned())
        .map_err(|_| Error::NotAFile(path.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        archive::read_image_set,
        cincinnati::{Graph, GraphNode, Update, Upgrades},
        config::{Image, Platform, ReleaseChannel},
        image::{TypedImage, TypedImageMapping},
        mirror::ReleaseContent,
        release::Download,
    };
    use semver::Version;

    struct FakeGraph(Graph);

    impl UpdateGraph for FakeGraph {
        fn calculate_upgrades(
            &mut self,
            _: &Context,
            _: &str,
            _: &str,
            _: &str,
            start: &Version,
            target: &Version,
        ) -> Result<Upgrades> {
            self.0.upgrades(start, target).map_err(Error::NotFound)
        }

        fn get_channel_latest(&mut self, _: &Context, _: &str, _: &str) -> Result<Version> {
            self.0
                .latest()
                .map(|update| update.version)
                .ok_or_else(|| Error::NotFound("latest".to_string()))
        }
    }

    fn graph() -> FakeGraph {
        let nodes = ["4.9.0", "4.9.5"]
            .iter()
            .map(|v| GraphNode {
                version: Version::parse(v).unwrap(),
                payload: format!("quay.io/openshift-release-dev/ocp-release:{}-x86_64", v),
            })
            .collect();
        FakeGraph(Graph {
            nodes,
            edges: vec![(0, 1)],
        })
    }

    /// Writes a one-layer release image, the layer being shared by every release
    struct FakeReleases;

    impl ReleaseMirrorer for FakeReleases {
        fn mirror(
            &mut self,
            _: &Context,
            download: &Download,
            to_dir: &Path,
            _dry_run: bool,
        ) -> Result<ReleaseContent> {
            let Update { version, image } = &download.update;
            let tag = format!("{}-{}", version, download.arch);
            let image_dir = to_dir.join("v2/openshift/release");
            fs::create_dir_all(image_dir.join("manifests"))?;
            fs::create_dir_all(image_dir.join("blobs"))?;

            let config = format!(r#"{{"version":"{}"}}"#, version);
            let config_digest = Digest::from_buf_sha256(config.as_bytes());
            let layer = b"shared layer";
            let layer_digest = Digest::from_buf_sha256(layer);
            let manifest = format!(
                r#"{{"schemaVersion":2,"config":{{"mediaType":"application/vnd.oci.image.config.v1+json","size":{},"digest":"{}"}},"layers":[{{"mediaType":"application/vnd.oci.image.layer.v1.tar","size":{},"digest":"{}"}}]}}"#,
                config.len(),
                config_digest,
                layer.len(),
                layer_digest
            );
            fs::write(image_dir.join("manifests").join(&tag), &manifest)?;
            fs::write(image_dir.join("blobs").join(config_digest.to_string()), &config)?;
            fs::write(image_dir.join("blobs").join(layer_digest.to_string()), layer)?;

            let mut mapping = TypedImageMapping::new();
            mapping.add(
                TypedImage::parse(image, ImageType::OcpRelease)?,
                TypedImage::new(
                    ImageReference::parse(&format!("file://openshift/release:{}", tag))?,
                    ImageType::OcpRelease,
                ),
            );
            Ok(ReleaseContent {
                release: image.clone(),
                mapping,
                images: vec![image.clone()],
            })
        }
    }

    fn config(version: &str) -> ImageSetConfiguration {
        let mut cfg = ImageSetConfiguration::default();
        cfg.mirror.platform = Platform {
            channels: vec![ReleaseChannel {
                name: "stable-4.9".to_string(),
                versions: vec![version.to_string()],
                ..Default::default()
            }],
            graph_url: None,
        };
        cfg
    }

    #[test]
    fn create_sequence() -> Result<()> {
        let ctx = Context::new();
        let dir = tempfile::tempdir()?;
        let opts = MirrorOptions {
            dir: dir.path().to_owned(),
            output_dir: Some(dir.path().join("out")),
            ..Default::default()
        };

        let parts = opts.create(&ctx, &config("4.9.0"), &mut graph(), &mut FakeReleases)?;
        assert_eq!(parts.len(), 1);
        let index = read_image_set(&parts[0])?;
        let layer = Digest::from_buf_sha256(b"shared layer");
        assert!(index.get(&layer.to_string()).is_some());
        assert!(index.get("4.9.0-amd64").is_some());

        let meta = LocalBackend::new(dir.path().join("src"))?
            .read_metadata(&ctx, &metadata_base_path())?;
        assert_eq!(meta.past_mirror.sequence, 1);
        assert!(meta.past_mirror.find_blob(&layer).is_some());

        // Second run only archives what is new
        let parts = opts.create(&ctx, &config("4.9.5"), &mut graph(), &mut FakeReleases)?;
        assert_eq!(parts.len(), 1);
        assert!(parts[0].ends_with("mirror_seq2_000000.tar"));
        let index = read_image_set(&parts[0])?;
        assert!(index.get(&layer.to_string()).is_none());
        assert!(index.get("4.9.5-amd64").is_some());

        let assocs = AssociationSet::read(&dir.path().join("src").join(associations_base_path()))?;
        assert_eq!(assocs.len(), 1);
        assocs.validate()?;
        let meta = LocalBackend::new(dir.path().join("src"))?
            .read_metadata(&ctx, &metadata_base_path())?;
        assert_eq!(meta.past_mirror.sequence, 2);
        assert_eq!(
            meta.past_mirror.mirror.platform.channels[0].versions,
            vec!["4.9.5".to_string()]
        );
        Ok(())
    }

    #[test]
    fn blocked_release() -> Result<()> {
        let ctx = Context::new();
        let dir = tempfile::tempdir()?;
        let opts = MirrorOptions {
            dir: dir.path().to_owned(),
            output_dir: Some(dir.path().join("out")),
            ..Default::default()
        };
        let mut cfg = config("4.9.0");
        cfg.mirror.blocked_images = vec![Image {
            name: "ocp-release".to_string(),
        }];
        match opts.create(&ctx, &cfg, &mut graph(), &mut FakeReleases) {
            Err(Error::Blocked(image)) => {
                assert_eq!(image, "quay.io/openshift-release-dev/ocp-release:4.9.0-x86_64")
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!dir.path().join("src/v2").exists());
        assert!(!dir.path().join("out").exists());

        // Other names do not block
        cfg.mirror.blocked_images[0].name = "ocp".to_string();
        assert_eq!(opts.create(&ctx, &cfg, &mut graph(), &mut FakeReleases)?.len(), 1);
        Ok(())
    }

    #[test]
    fn dry_run_writes_nothing() -> Result<()> {
        let ctx = Context::new();
        let dir = tempfile::tempdir()?;
        let opts = MirrorOptions {
            dir: dir.path().to_owned(),
            output_dir: Some(dir.path().join("out")),
            dry_run: true,
            ..Default::default()
        };
        let parts = opts.create(&ctx, &config("4.9.0"), &mut graph(), &mut FakeReleases)?;
        assert!(parts.is_empty());
        assert!(!dir.path().join("src/publish").exists());
        Ok(())
    }
}
