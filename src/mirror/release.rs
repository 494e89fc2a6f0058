use super::{pin_image, ReleaseContent, ReleaseMirrorer};
use crate::{
    config::{BLOB_DIR, MANIFEST_DIR, V2_DIR},
    distribution::{Client, Reference, Tls},
    error::*,
    image::{ImageReference, ImageType, TypedImage, TypedImageMapping},
    release::Download,
    Context, Digest,
};
use std::{fs, path::Path};

/// Repository of releases in a workspace
const RELEASE_REPOSITORY: &str = "openshift/release";

/// [ReleaseMirrorer] copying the release image itself from its registry.
///
/// The release is stored as `file://openshift/release:<version>-<arch>`.
pub struct RegistryReleaseMirrorer {
    tls: Tls,
}

impl RegistryReleaseMirrorer {
    pub fn new(tls: Tls) -> Self {
        RegistryReleaseMirrorer { tls }
    }
}

impl ReleaseMirrorer for RegistryReleaseMirrorer {
    fn mirror(
        &mut self,
        ctx: &Context,
        download: &Download,
        to_dir: &Path,
        dry_run: bool,
    ) -> Result<ReleaseContent> {
        let source = ImageReference::parse(&download.update.image)?;
        let release = pin_image(ctx, &source, self.tls)?;
        let tag = format!("{}-{}", download.update.version, download.arch);
        let dest = ImageReference::parse(&format!("file://{}:{}", RELEASE_REPOSITORY, tag))?;

        let mut mapping = TypedImageMapping::new();
        mapping.add(
            TypedImage::parse(&release, ImageType::OcpRelease)?,
            TypedImage::new(dest.clone(), ImageType::OcpRelease),
        );
        let content = ReleaseContent {
            release: release.clone(),
            mapping,
            images: vec![release.clone()],
        };
        if dry_run {
            log::info!("{} -> {} (dry run)", release, dest);
            return Ok(content);
        }

        let pinned = ImageReference::parse(&release)?;
        let mut client = Client::from_image_reference(&pinned, self.tls)?;
        let image_dir = to_dir.join(V2_DIR).join(dest.path());
        copy_manifest(ctx, &mut client, &pinned.manifest_reference(), &image_dir, Some(&tag))?;
        Ok(content)
    }
}

/// Store a manifest with its blobs, or an index with its children, under `image_dir`
fn copy_manifest(
    ctx: &Context,
    client: &mut Client,
    reference: &Reference,
    image_dir: &Path,
    tag: Option<&str>,
) -> Result<()> {
    let (_media_type, buf) = client.get_manifest_bytes(ctx, reference)?;
    let digest = Digest::from_buf_sha256(&buf);
    if let Reference::Digest(want) = reference {
        want.verify(&buf)?;
    }
    let manifest_dir = image_dir.join(MANIFEST_DIR);
    fs::create_dir_all(&manifest_dir)?;
    fs::write(manifest_dir.join(digest.to_string()), &buf)?;
    if let Some(tag) = tag {
        fs::write(manifest_dir.join(tag), &buf)?;
    }

    let value: serde_json::Value = serde_json::from_slice(&buf)?;
    if value.get("manifests").is_some() {
        let index = oci_spec::image::ImageIndex::from_reader(buf.as_slice())?;
        for child in index.manifests() {
            let child = Digest::from_descriptor(child)?;
            copy_manifest(ctx, client, &Reference::Digest(child), image_dir, None)?;
        }
        return Ok(());
    }

    let manifest = oci_spec::image::ImageManifest::from_reader(buf.as_slice())?;
    let blob_dir = image_dir.join(BLOB_DIR);
    fs::create_dir_all(&blob_dir)?;
    let blobs = std::iter::once(manifest.config()).chain(manifest.layers().iter());
    for descriptor in blobs {
        let digest = Digest::from_descriptor(descriptor)?;
        let path = blob_dir.join(digest.to_string());
        if path.exists() {
            continue;
        }
        let blob = client.get_blob(ctx, &digest)?;
        digest.verify(&blob)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&blob_dir)?;
        std::io::Write::write_all(&mut tmp, &blob)?;
        tmp.persist(&path)?;
    }
    Ok(())
}
