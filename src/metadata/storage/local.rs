use super::Backend;
use crate::{error::*, Context};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Documents stored as files under a directory
#[derive(Debug, Clone)]
pub struct LocalBackend {
    dir: PathBuf,
}

impl LocalBackend {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(LocalBackend { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Backend for LocalBackend {
    fn read_object(&mut self, ctx: &Context, path: &Path) -> Result<Vec<u8>> {
        ctx.check()?;
        let path = self.dir.join(path);
        match fs::read(&path) {
            Ok(buf) => Ok(buf),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write into a temporary file next to the target and rename it
    fn write_object(&mut self, ctx: &Context, path: &Path, buf: &[u8]) -> Result<()> {
        ctx.check()?;
        let path = self.dir.join(path);
        let parent = path.parent().unwrap_or(&self.dir);
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(buf)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)?;
        log::debug!("Wrote {}", path.display());
        Ok(())
    }

    fn cleanup(&mut self, ctx: &Context, path: &Path) -> Result<()> {
        ctx.check()?;
        let path = self.dir.join(path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
