use super::{ImagePusher, Mapping, SecurityOptions};
use crate::{
    config::{BLOB_DIR, MANIFEST_DIR, V2_DIR},
    distribution::{Client, Reference, Tls},
    error::*,
    Context, Digest,
};
use oci_spec::image::MediaType;
use std::{collections::BTreeMap, fs, path::Path};

/// [ImagePusher] reading `<from_dir>/v2/<path>` and pushing with the distribution client
#[derive(Default)]
pub struct RegistryPusher {
    clients: BTreeMap<String, Client>,
}

impl RegistryPusher {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&mut self, mapping: &Mapping, tls: Tls) -> Result<&mut Client> {
        let dest = &mapping.destination;
        let key = format!("{}/{}", dest.registry, dest.path());
        Ok(match self.clients.entry(key) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(Client::from_image_reference(dest, tls)?)
            }
        })
    }

    fn push_image(
        &mut self,
        ctx: &Context,
        mapping: &Mapping,
        from_dir: &Path,
        opts: &SecurityOptions,
    ) -> Result<()> {
        let image_dir = from_dir.join(V2_DIR).join(mapping.source.path());
        let id = mapping
            .source
            .id
            .as_ref()
            .ok_or_else(|| Error::InvalidReference(mapping.source.to_string()))?;
        let buf = fs::read(image_dir.join(MANIFEST_DIR).join(id.to_string()))?;
        id.verify(&buf)?;
        let manifest = Manifest::parse(&buf)?;

        if opts.dry_run {
            log::info!(
                "{} -> {} (dry run, {} blobs)",
                mapping.source,
                mapping.destination,
                manifest.blobs.len()
            );
            return Ok(());
        }

        let client = self.client(mapping, opts.tls)?;
        for digest in &manifest.blobs {
            ctx.check()?;
            if client.has_blob(ctx, digest)? {
                log::debug!("blob {} already exists in {}", digest, client.name());
                continue;
            }
            let blob = fs::read(image_dir.join(BLOB_DIR).join(digest.to_string()))?;
            digest.verify(&blob)?;
            client.push_blob(ctx, &blob)?;
        }
        client.push_manifest_bytes(ctx, &Reference::Digest(id.clone()), &manifest.media_type, &buf)?;
        if let Some(tag) = &mapping.destination.tag {
            client.push_manifest_bytes(ctx, &Reference::Tag(tag.clone()), &manifest.media_type, &buf)?;
        }
        Ok(())
    }
}

impl ImagePusher for RegistryPusher {
    fn push(
        &mut self,
        ctx: &Context,
        mappings: &[Mapping],
        from_dir: &Path,
        opts: &SecurityOptions,
    ) -> Result<()> {
        let mut errs = Vec::new();
        for mapping in mappings {
            ctx.check()?;
            if let Err(e) = self.push_image(ctx, mapping, from_dir, opts) {
                log::error!("{}: {}", mapping.name, e);
                errs.push(e);
            }
        }
        Error::aggregate(errs)
    }
}

/// Media type and blobs of a stored manifest. Children of an index are pushed as separate mappings.
struct Manifest {
    media_type: String,
    blobs: Vec<Digest>,
}

impl Manifest {
    fn parse(buf: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(buf)?;
        let declared = value
            .get("mediaType")
            .and_then(|media_type| media_type.as_str())
            .map(|media_type| media_type.to_string());
        if value.get("manifests").is_some() {
            return Ok(Manifest {
                media_type: declared.unwrap_or_else(|| MediaType::ImageIndex.to_string()),
                blobs: Vec::new(),
            });
        }
        let manifest = oci_spec::image::ImageManifest::from_reader(buf)?;
        let mut blobs = vec![Digest::from_descriptor(manifest.config())?];
        for layer in manifest.layers() {
            blobs.push(Digest::from_descriptor(layer)?);
        }
        Ok(Manifest {
            media_type: declared.unwrap_or_else(|| MediaType::ImageManifest.to_string()),
            blobs,
        })
    }
}
