use super::{write_results, CatalogRebuilder, ImagePusher, Mapping, MirrorOptions, SecurityOptions};
use crate::{
    archive::{read_image_set, unpack_all, unpack_dir},
    config::{
        associations_base_path, metadata_base_path, StorageConfig, BLOB_DIR, CATALOGS_DIR,
        HELM_DIR, V2_DIR,
    },
    error::*,
    image::{Association, AssociationSet, ImageReference, Node, TypedImage, TypedImageMapping},
    metadata::{
        check_sequence,
        storage::{by_config, LocalBackend, RegistryBackend},
        Backend, Metadata,
    },
    reconcile::{BlobFetcher, Reconciler},
    Context, Logger,
};
use std::{fs, path::Path};

impl MirrorOptions {
    /// Publish the image set archive at [MirrorOptions::from] to [MirrorOptions::to_mirror].
    ///
    /// Returns the mapping of the top-level images which have been pushed,
    /// also written with the derived cluster resources into the output directory.
    /// Destination metadata is replaced by the one of the image set only if every image succeeded.
    pub fn publish(
        &self,
        ctx: &Context,
        pusher: &mut dyn ImagePusher,
        fetcher: &mut dyn BlobFetcher,
        rebuilder: Option<&mut dyn CatalogRebuilder>,
    ) -> Result<TypedImageMapping> {
        let logger = self.logger.child("publish");
        logger.info(format!(
            "Publishing image set from archive {} to registry {}",
            self.from.display(),
            self.to_mirror
        ));
        let mirror_root = self.mirror_root();
        // Fail early on a destination which is not a registry
        ImageReference::under(&mirror_root, "oc-mirror")?;

        let output_dir = self.output_dir();
        fs::create_dir_all(&output_dir)?;
        fs::create_dir_all(&self.dir)?;
        let workspace = tempfile::Builder::new()
            .prefix("imageset")
            .tempdir_in(&self.dir)?;
        logger.debug(format!("Unarchiving metadata into {}", workspace.path().display()));

        let index = read_image_set(&self.from)?;
        unpack_all(&index, workspace.path(), &[BLOB_DIR, V2_DIR, HELM_DIR])?;

        let incoming = LocalBackend::new(workspace.path().to_owned())?
            .read_metadata(ctx, &metadata_base_path())?;

        let mut backend = self.destination_backend(&logger, &incoming, &mirror_root)?;
        let result = self
            .publish_image_set(
                ctx,
                &logger,
                backend.as_mut(),
                &incoming,
                &index,
                workspace.path(),
                &output_dir,
                pusher,
                fetcher,
                rebuilder,
            )
            .and_then(|mapping| {
                for path in write_results(&mapping, &output_dir)? {
                    logger.info(format!("Wrote {}", path.display()));
                }
                Ok(mapping)
            });

        if incoming.single_use {
            if let Err(e) = backend.cleanup(ctx, &metadata_base_path()) {
                logger.error(e.to_string());
            }
        }
        if self.skip_cleanup {
            let kept = workspace.into_path();
            logger.info(format!("Workspace kept at {}", kept.display()));
        }
        result
    }

    fn destination_backend(
        &self,
        logger: &Logger,
        incoming: &Metadata,
        mirror_root: &str,
    ) -> Result<Box<dyn Backend>> {
        if incoming.single_use {
            logger.warn("metadata has single-use label, using stateless mode");
            let cfg = StorageConfig {
                local: Some(crate::config::LocalConfig {
                    path: self.dir.clone(),
                }),
                registry: None,
            };
            return by_config(&self.dir, &cfg);
        }
        if let Some(cfg) = &self.metadata_storage {
            return by_config(&self.dir, cfg);
        }
        let image = ImageReference::under(mirror_root, &format!("oc-mirror:{}", incoming.uid))?;
        Ok(Box::new(RegistryBackend::new(image, self.dest_tls())?))
    }

    #[allow(clippy::too_many_arguments)]
    fn publish_image_set(
        &self,
        ctx: &Context,
        logger: &Logger,
        backend: &mut dyn Backend,
        incoming: &Metadata,
        index: &crate::archive::ArchiveIndex,
        workspace: &Path,
        output_dir: &Path,
        pusher: &mut dyn ImagePusher,
        fetcher: &mut dyn BlobFetcher,
        rebuilder: Option<&mut dyn CatalogRebuilder>,
    ) -> Result<TypedImageMapping> {
        let current = match backend.read_metadata(ctx, &metadata_base_path()) {
            Ok(current) => Some(current),
            Err(Error::MetadataNotExist) => {
                logger.info("No existing metadata found. Setting up new workspace");
                None
            }
            Err(e) => return Err(e),
        };
        logger.debug("Check metadata sequence number");
        check_sequence(current.as_ref(), incoming, self.uid_policy)?;

        logger.debug(format!("Unpacking any provided Helm charts to {}", output_dir.display()));
        unpack_dir(index, HELM_DIR, output_dir)?;

        let assocs = AssociationSet::read(&workspace.join(associations_base_path()))?;
        let provenance = current
            .as_ref()
            .map(|meta| meta.past_mirror.blobs.as_slice())
            .unwrap_or_default();
        let mirror_root = self.mirror_root();
        let opts = SecurityOptions {
            tls: self.dest_tls(),
            dry_run: self.dry_run,
        };

        let mut all_mappings = TypedImageMapping::new();
        let mut errs = Vec::new();
        for key in assocs.keys() {
            ctx.check()?;
            let image_dir = tempfile::Builder::new()
                .prefix("images.")
                .tempdir_in(workspace)?;

            let mut reconciler = Reconciler::new(
                index,
                provenance,
                &mirror_root,
                opts.tls,
                &mut *fetcher,
                logger.child("reconcile"),
            );
            match reconciler.reconcile(ctx, &assocs, key, image_dir.path()) {
                Ok(()) => {}
                Err(e @ (Error::Cancelled | Error::DeadlineExceeded)) => return Err(e),
                Err(e) => {
                    logger.error(format!("image {}: {}", key, e));
                    errs.push(e);
                    continue;
                }
            }

            let mappings = match image_mappings(&assocs, key, &mirror_root, &mut all_mappings) {
                Ok(mappings) => mappings,
                Err(e) => {
                    errs.push(e);
                    continue;
                }
            };
            if logger.is_debug() {
                let sources: Vec<String> = mappings.iter().map(|m| m.source.to_string()).collect();
                logger.debug(format!("mirroring images: {:?}", sources));
            }
            if let Err(e) = pusher.push(ctx, &mappings, image_dir.path(), &opts) {
                logger.error(format!("image {}: {}", key, e));
                errs.push(e);
            }

            if self.skip_cleanup {
                let _kept = image_dir.into_path();
            }
        }
        Error::aggregate(errs)?;

        if workspace.join(CATALOGS_DIR).is_dir() {
            match rebuilder {
                Some(rebuilder) => {
                    logger.debug("rebuilding catalog images");
                    all_mappings.merge(rebuilder.rebuild(ctx, workspace, &mirror_root)?);
                }
                None => logger.warn("catalogs found in image set, but no catalog rebuilder is given"),
            }
        }

        ctx.check()?;
        if self.dry_run {
            logger.info("Dry run, metadata is not updated");
        } else {
            backend.write_metadata(ctx, incoming, &metadata_base_path())?;
        }
        Ok(all_mappings)
    }
}

/// Mappings of every association of the image `key`, children of an index first.
///
/// The top-level association is added to `all_mappings`.
fn image_mappings(
    assocs: &AssociationSet,
    key: &str,
    mirror_root: &str,
    all_mappings: &mut TypedImageMapping,
) -> Result<Vec<Mapping>> {
    let values = assocs
        .search(key)
        .ok_or_else(|| Error::MissingAssociationKey(key.to_string()))?;
    let mut ordered: Vec<&Association> = values.values().collect();
    ordered.sort_by_key(|assoc| matches!(assoc.node, Node::Manifests(_)));

    let mut mappings = Vec::new();
    for assoc in ordered {
        let mut source = ImageReference::parse(&format!("file://{}", assoc.path))?;
        source.tag = assoc.tag_symlink.clone();
        source.id = Some(assoc.id.clone());
        let mut destination = ImageReference::under(mirror_root, &assoc.path)?;
        destination.tag = source.tag.clone();
        destination.id = source.id.clone();

        if assoc.name == key {
            all_mappings.add(
                TypedImage::parse(key, assoc.image_type)?,
                TypedImage::new(destination.clone(), assoc.image_type),
            );
        }
        mappings.push(Mapping {
            name: assoc.name.clone(),
            source,
            destination,
        });
    }
    Ok(mappings)
}
