//! Where metadata is persisted

mod local;
mod registry;

pub use local::LocalBackend;
pub use registry::RegistryBackend;

use crate::{
    config::StorageConfig, distribution::Tls, error::*, image::ImageReference, metadata::Metadata,
    Context,
};
use std::path::Path;

/// Storage of metadata and other documents, addressed by relative path
pub trait Backend {
    /// Read a stored document, [Error::NotFound] if absent
    fn read_object(&mut self, ctx: &Context, path: &Path) -> Result<Vec<u8>>;

    /// Replace the document at `path`
    fn write_object(&mut self, ctx: &Context, path: &Path, buf: &[u8]) -> Result<()>;

    /// Remove the document at `path`, if any
    fn cleanup(&mut self, ctx: &Context, path: &Path) -> Result<()>;

    /// Read metadata, [Error::MetadataNotExist] if absent
    fn read_metadata(&mut self, ctx: &Context, path: &Path) -> Result<Metadata> {
        match self.read_object(ctx, path) {
            Ok(buf) => Ok(serde_json::from_slice(&buf)?),
            Err(e) if e.is_not_exist() => Err(Error::MetadataNotExist),
            Err(e) => Err(e),
        }
    }

    fn write_metadata(&mut self, ctx: &Context, meta: &Metadata, path: &Path) -> Result<()> {
        let buf = serde_json::to_vec_pretty(meta)?;
        self.write_object(ctx, path, &buf)
    }
}

/// Create a backend from configuration, local storage under `dir` if nothing is configured
pub fn by_config(dir: &Path, cfg: &StorageConfig) -> Result<Box<dyn Backend>> {
    match (&cfg.local, &cfg.registry) {
        (Some(_), Some(_)) => Err(Error::InvalidConfig(
            "only one storage backend can be configured".to_string(),
        )),
        (Some(local), None) => Ok(Box::new(LocalBackend::new(local.path.clone())?)),
        (None, Some(registry)) => {
            let image = ImageReference::parse(&registry.image_url)?;
            let tls = Tls::new(false, registry.skip_tls);
            Ok(Box::new(RegistryBackend::new(image, tls)?))
        }
        (None, None) => Ok(Box::new(LocalBackend::new(dir.to_owned())?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocalConfig, RegistryConfig};

    #[test]
    fn local_by_config() -> Result<()> {
        let ctx = Context::new();
        let dir = tempfile::tempdir()?;
        let cfg = StorageConfig {
            local: Some(LocalConfig {
                path: dir.path().join("metadata"),
            }),
            registry: None,
        };
        let mut backend = by_config(dir.path(), &cfg)?;
        let path = crate::config::metadata_base_path();
        assert!(matches!(
            backend.read_metadata(&ctx, &path),
            Err(Error::MetadataNotExist)
        ));
        let meta = Metadata::new();
        backend.write_metadata(&ctx, &meta, &path)?;
        assert!(dir.path().join("metadata/publish/.metadata.json").is_file());
        assert_eq!(backend.read_metadata(&ctx, &path)?, meta);
        Ok(())
    }

    #[test]
    fn both_configured() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = StorageConfig {
            local: Some(LocalConfig {
                path: dir.path().to_owned(),
            }),
            registry: Some(RegistryConfig {
                image_url: "localhost:5000/oc-mirror:test".to_string(),
                skip_tls: false,
            }),
        };
        assert!(by_config(dir.path(), &cfg).is_err());
        Ok(())
    }
}
