use super::Backend;
use crate::{
    archive::create_file_header,
    distribution::{Client, Reference, Tls},
    error::*,
    image::ImageReference,
    Context, Digest,
};
use oci_spec::image::{DescriptorBuilder, ImageManifest, ImageManifestBuilder, MediaType};
use std::{
    collections::BTreeMap,
    io::Read,
    path::{Path, PathBuf},
};

const CONFIG_MEDIA_TYPE: &str = "application/vnd.ocmirror.metadata.config.v1+json";
const LAYER_MEDIA_TYPE: &str = "application/vnd.ocmirror.metadata.layer.v1.tar";

/// Documents stored as a tar layer of a single-layer artifact in a registry
///
/// Every write replaces the artifact with a new one containing all documents.
pub struct RegistryBackend {
    image: ImageReference,
    client: Client,
}

impl RegistryBackend {
    pub fn new(image: ImageReference, tls: Tls) -> Result<Self> {
        let client = Client::from_image_reference(&image, tls)?;
        Ok(RegistryBackend { image, client })
    }

    fn reference(&self) -> Reference {
        self.image.manifest_reference()
    }

    /// All documents in the current artifact, empty if there is no artifact yet
    fn load(&mut self, ctx: &Context) -> Result<BTreeMap<PathBuf, Vec<u8>>> {
        let reference = self.reference();
        let manifest = match self.client.get_manifest(ctx, &reference) {
            Ok(manifest) => manifest,
            Err(Error::NotFound(_)) => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };
        let layer = manifest
            .layers()
            .first()
            .ok_or_else(|| Error::NotFound(format!("metadata layer in {}", self.image)))?;
        let digest = Digest::from_descriptor(layer)?;
        let blob = self.client.get_blob(ctx, &digest)?;
        digest.verify(&blob)?;
        unpack_layer(&blob)
    }

    fn store(&mut self, ctx: &Context, objects: &BTreeMap<PathBuf, Vec<u8>>) -> Result<()> {
        let layer = pack_layer(objects)?;
        let (layer_digest, _) = self.client.push_blob(ctx, &layer)?;
        let config = b"{}";
        let (config_digest, _) = self.client.push_blob(ctx, config)?;

        let manifest = build_manifest(&config_digest, config.len(), &layer_digest, layer.len())?;
        let reference = self.reference();
        self.client.push_manifest(ctx, &reference, &manifest)?;
        Ok(())
    }
}

impl Backend for RegistryBackend {
    fn read_object(&mut self, ctx: &Context, path: &Path) -> Result<Vec<u8>> {
        let mut objects = self.load(ctx)?;
        objects
            .remove(path)
            .ok_or_else(|| Error::NotFound(format!("{} in {}", path.display(), self.image)))
    }

    fn write_object(&mut self, ctx: &Context, path: &Path, buf: &[u8]) -> Result<()> {
        let mut objects = self.load(ctx)?;
        objects.insert(path.to_owned(), buf.to_vec());
        self.store(ctx, &objects)
    }

    fn cleanup(&mut self, ctx: &Context, path: &Path) -> Result<()> {
        let mut objects = self.load(ctx)?;
        if objects.remove(path).is_none() {
            return Ok(());
        }
        if objects.is_empty() {
            let reference = self.reference();
            return match self.client.delete_manifest(ctx, &reference) {
                Err(Error::NotFound(_)) => Ok(()),
                other => other,
            };
        }
        self.store(ctx, &objects)
    }
}

fn build_manifest(
    config: &Digest,
    config_size: usize,
    layer: &Digest,
    layer_size: usize,
) -> Result<ImageManifest> {
    let config = DescriptorBuilder::default()
        .media_type(MediaType::Other(CONFIG_MEDIA_TYPE.to_string()))
        .size(config_size as i64)
        .digest(config.to_string())
        .build()?;
    let layer = DescriptorBuilder::default()
        .media_type(MediaType::Other(LAYER_MEDIA_TYPE.to_string()))
        .size(layer_size as i64)
        .digest(layer.to_string())
        .build()?;
    Ok(ImageManifestBuilder::default()
        .schema_version(2_u32)
        .config(config)
        .layers(vec![layer])
        .build()?)
}

fn pack_layer(objects: &BTreeMap<PathBuf, Vec<u8>>) -> Result<Vec<u8>> {
    let mut ar = tar::Builder::new(Vec::new());
    for (path, buf) in objects {
        ar.append_data(&mut create_file_header(buf.len()), path, buf.as_slice())?;
    }
    Ok(ar.into_inner()?)
}

fn unpack_layer(blob: &[u8]) -> Result<BTreeMap<PathBuf, Vec<u8>>> {
    let mut ar = tar::Archive::new(blob);
    let mut objects = BTreeMap::new();
    for entry in ar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        objects.insert(path, buf);
    }
    Ok(objects)
}
