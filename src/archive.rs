//! Image set archives, plain tar files possibly split into several parts
//!
//! Layout of members in an image set:
//!
//! ```text
//! publish/.metadata.json
//! internal/image-associations
//! v2/<path>/manifests/<digest or tag>
//! blobs/<digest>
//! ```

use crate::error::*;
use chrono::Utc;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::{self, Write},
    path::{Component, Path, PathBuf},
};

pub const ARCHIVE_EXTENSION: &str = "tar";

const BLOCK_SIZE: u64 = 512;
/// Two zero blocks closing every tar stream
const TRAILER_SIZE: u64 = 2 * BLOCK_SIZE;
/// Longer member paths are stored in an extra GNU long name entry
const MAX_HEADER_NAME: usize = 100;

pub(crate) fn create_file_header(size: usize) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_size(size as u64);
    header.set_mode(0b110100100); // rw-r--r--
    header.set_mtime(Utc::now().timestamp() as u64);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    header
}

/// Archive part containing each member, keyed by the base name of the member
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveIndex {
    files: BTreeMap<String, PathBuf>,
}

impl ArchiveIndex {
    pub fn get(&self, name: &str) -> Option<&Path> {
        self.files.get(name).map(|p| p.as_path())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// All archive parts
    pub fn parts(&self) -> BTreeSet<&Path> {
        self.files.values().map(|p| p.as_path()).collect()
    }

    /// Extract `member` into `dest/member`, from the part indexed for its base name.
    ///
    /// Nothing is done if the destination already exists, even if the member is not indexed.
    pub fn unpack(&self, member: &Path, dest: &Path) -> Result<()> {
        let member = &member_path(member)?;
        if dest.join(member).exists() {
            return Ok(());
        }
        let name = base_name(member)
            .ok_or_else(|| Error::ArchiveFileNotFound(member.display().to_string()))?;
        let part = self
            .get(&name)
            .ok_or_else(|| Error::ArchiveFileNotFound(name.clone()))?;
        extract(part, member, dest)
    }

    fn index_part(&mut self, part: &Path) -> Result<()> {
        log::debug!("Indexing archive {}", part.display());
        let f = fs::File::open(part)?;
        let mut ar = tar::Archive::new(io::BufReader::new(f));
        for entry in ar.entries()? {
            let entry = entry?;
            if entry.header().entry_type().is_dir() {
                continue;
            }
            if let Some(name) = base_name(&entry.path()?) {
                if let Some(previous) = self.files.insert(name.clone(), part.to_owned()) {
                    if previous != part {
                        log::debug!(
                            "{} found in both {} and {}",
                            name,
                            previous.display(),
                            part.display()
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

fn base_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.to_string())
}

/// Index an archive file, or all archives found under a directory
pub fn read_image_set(from: &Path) -> Result<ArchiveIndex> {
    let mut index = ArchiveIndex::default();
    if from.is_file() {
        index.index_part(from)?;
        return Ok(index);
    }
    if !from.is_dir() {
        return Err(Error::NotAFile(from.to_owned()));
    }
    for entry in walkdir::WalkDir::new(from).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type().is_file()
            && path.extension().and_then(|ext| ext.to_str()) == Some(ARCHIVE_EXTENSION)
        {
            index.index_part(path)?;
        }
    }
    Ok(index)
}

/// Member path relative to the extraction root, without `.` components.
///
/// Absolute paths and `..` are rejected so that nothing is written outside of the root.
pub(crate) fn member_path(path: &Path) -> Result<PathBuf> {
    let mut rel = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            _ => return Err(Error::UnsafeArchivePath(path.display().to_string())),
        }
    }
    Ok(rel)
}

/// Extract `member` of archive `part` into `dest/member`.
///
/// Nothing is done if the destination already exists.
pub fn extract(part: &Path, member: &Path, dest: &Path) -> Result<()> {
    let member = &member_path(member)?;
    let target = dest.join(member);
    if target.exists() {
        log::debug!("{} already exists", target.display());
        return Ok(());
    }
    let f = fs::File::open(part)?;
    let mut ar = tar::Archive::new(io::BufReader::new(f));
    for entry in ar.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() || member_path(&entry.path()?)? != *member {
            continue;
        }
        let parent = target.parent().unwrap_or(dest);
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        io::copy(&mut entry, &mut tmp)?;
        tmp.persist(&target)?;
        return Ok(());
    }
    Err(Error::ArchiveFileNotFound(member.display().to_string()))
}

fn top_dir(member: &Path) -> &str {
    member
        .components()
        .next()
        .and_then(|c| c.as_os_str().to_str())
        .unwrap_or_default()
}

/// Extract every member of every part, except those under one of `exclude` top-level directories
pub fn unpack_all(index: &ArchiveIndex, dest: &Path, exclude: &[&str]) -> Result<()> {
    unpack_matching(index, dest, |member| {
        if exclude.contains(&top_dir(member)) {
            None
        } else {
            Some(member.to_owned())
        }
    })
}

/// Extract members under the top-level directory `dir` into `dest`, stripping `dir`
pub fn unpack_dir(index: &ArchiveIndex, dir: &str, dest: &Path) -> Result<()> {
    unpack_matching(index, dest, |member| {
        member.strip_prefix(dir).ok().map(|rel| rel.to_owned())
    })
}

/// Extract members for which `target` returns a path relative to `dest`
fn unpack_matching<F>(index: &ArchiveIndex, dest: &Path, target: F) -> Result<()>
where
    F: Fn(&Path) -> Option<PathBuf>,
{
    for part in index.parts() {
        log::info!("Extracting archive {}", part.display());
        let f = fs::File::open(part)?;
        let mut ar = tar::Archive::new(io::BufReader::new(f));
        for entry in ar.entries()? {
            let mut entry = entry?;
            // Links and devices are never part of an image set
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let member = member_path(&entry.path()?)?;
            let path = match target(&member) {
                Some(rel) if rel.as_os_str().is_empty() => continue,
                Some(rel) => dest.join(rel),
                None => continue,
            };
            if path.exists() {
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&path)?;
        }
    }
    Ok(())
}

/// Bytes a member takes in the tar stream, with its headers and padding
fn entry_size(member: &Path, size: u64) -> u64 {
    let padded = |n: u64| (n + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE;
    let name = member.as_os_str().len();
    let long_name = if name > MAX_HEADER_NAME {
        BLOCK_SIZE + padded(name as u64 + 1)
    } else {
        0
    };
    long_name + BLOCK_SIZE + padded(size)
}

/// Write an image set into tar parts of bounded size
pub struct ArchiveWriter {
    dir: PathBuf,
    prefix: String,
    max_size: Option<u64>,
    current: Option<(tar::Builder<io::BufWriter<fs::File>>, u64)>,
    parts: Vec<PathBuf>,
}

impl ArchiveWriter {
    /// Parts are written as `dir/<prefix>_<index>.tar`.
    /// A part is closed before its file exceeds `max_size` bytes, tar headers and padding included,
    /// unless a single member is larger.
    pub fn new(dir: &Path, prefix: &str, max_size: Option<u64>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(ArchiveWriter {
            dir: dir.to_owned(),
            prefix: prefix.to_string(),
            max_size,
            current: None,
            parts: Vec::new(),
        })
    }

    fn builder(
        &mut self,
        member: &Path,
        size: u64,
    ) -> Result<&mut tar::Builder<io::BufWriter<fs::File>>> {
        let size = entry_size(member, size);
        let full = match (&self.current, self.max_size) {
            (Some((_, written)), Some(max)) => {
                *written > 0 && written + size + TRAILER_SIZE > max
            }
            _ => false,
        };
        if full {
            self.close_part()?;
        }
        if self.current.is_none() {
            let path = self.dir.join(format!(
                "{}_{:06}.{}",
                self.prefix,
                self.parts.len(),
                ARCHIVE_EXTENSION
            ));
            if path.exists() {
                return Err(Error::UnknownIo(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} already exists", path.display()),
                )));
            }
            log::info!("Creating archive {}", path.display());
            let f = io::BufWriter::new(fs::File::create(&path)?);
            self.parts.push(path);
            self.current = Some((tar::Builder::new(f), 0));
        }
        let (builder, written) = self
            .current
            .as_mut()
            .ok_or_else(|| Error::NotFound("open archive part".to_string()))?;
        *written += size;
        Ok(builder)
    }

    fn close_part(&mut self) -> Result<()> {
        if let Some((builder, _)) = self.current.take() {
            let mut f = builder.into_inner()?;
            f.flush()?;
        }
        Ok(())
    }

    pub fn append_data(&mut self, member: &Path, buf: &[u8]) -> Result<()> {
        let builder = self.builder(member, buf.len() as u64)?;
        builder.append_data(&mut create_file_header(buf.len()), member, buf)?;
        Ok(())
    }

    pub fn append_file(&mut self, member: &Path, src: &Path) -> Result<()> {
        let size = fs::metadata(src)?.len();
        let mut f = fs::File::open(src)?;
        let builder = self.builder(member, size)?;
        builder.append_data(&mut create_file_header(size as usize), member, &mut f)?;
        Ok(())
    }

    /// Close the last part and return all written parts
    pub fn finish(mut self) -> Result<Vec<PathBuf>> {
        self.close_part()?;
        Ok(std::mem::take(&mut self.parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_set(dir: &Path, max_size: Option<u64>) -> Result<Vec<PathBuf>> {
        let mut w = ArchiveWriter::new(dir, "mirror_seq1", max_size)?;
        w.append_data(Path::new("publish/.metadata.json"), b"{}")?;
        w.append_data(Path::new("blobs/sha256:aaaa"), &[1; 100])?;
        w.append_data(Path::new("v2/ubi8/ubi/manifests/latest"), b"manifest")?;
        w.finish()
    }

    #[test]
    fn index_and_extract() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let parts = write_set(&dir.path().join("archives"), None)?;
        assert_eq!(parts.len(), 1);

        let index = read_image_set(&parts[0])?;
        assert_eq!(index.len(), 3);
        assert_eq!(index.get("latest"), Some(parts[0].as_path()));

        let dest = dir.path().join("unpack");
        let member = Path::new("v2/ubi8/ubi/manifests/latest");
        index.unpack(member, &dest)?;
        assert_eq!(fs::read(dest.join(member))?, b"manifest");
        // Existing file is kept as is
        fs::write(dest.join(member), b"changed")?;
        index.unpack(member, &dest)?;
        assert_eq!(fs::read(dest.join(member))?, b"changed");

        assert!(matches!(
            index.unpack(Path::new("blobs/sha256:bbbb"), &dest),
            Err(Error::ArchiveFileNotFound(_))
        ));
        // Indexed by base name, but not at this path
        assert!(matches!(
            extract(&parts[0], Path::new("other/latest"), &dest),
            Err(Error::ArchiveFileNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn split_parts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let parts = write_set(dir.path(), Some(50))?;
        assert_eq!(parts.len(), 3);

        let index = read_image_set(dir.path())?;
        assert_eq!(index.parts().len(), 3);
        assert_eq!(index.get("sha256:aaaa"), Some(parts[1].as_path()));

        let dest = dir.path().join("unpack");
        unpack_all(&index, &dest, &["blobs", "v2"])?;
        assert!(dest.join("publish/.metadata.json").is_file());
        assert!(!dest.join("blobs").exists());
        assert!(!dest.join("v2").exists());

        let charts = dir.path().join("charts");
        unpack_dir(&index, "v2", &charts)?;
        assert_eq!(fs::read(charts.join("ubi8/ubi/manifests/latest"))?, b"manifest");
        assert!(!charts.join("publish").exists());
        Ok(())
    }

    #[test]
    fn part_size_with_headers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // Each member takes a header block and a data block, plus the trailer of the part
        let parts = write_set(dir.path(), Some(3072))?;
        assert_eq!(parts.len(), 2);
        for part in &parts {
            assert!(fs::metadata(part)?.len() <= 3072);
        }
        assert_eq!(fs::metadata(&parts[0])?.len(), 3072);

        let long = Path::new("v2").join("a".repeat(120)).join("manifests/latest");
        assert_eq!(entry_size(&long, 8), 512 + 512 + 512 + 512);
        assert_eq!(entry_size(Path::new("blobs/sha256:aaaa"), 512), 1024);
        assert_eq!(entry_size(Path::new("blobs/sha256:aaaa"), 0), 512);
        Ok(())
    }

    /// Tar with a single member whose raw header name is `name`
    fn write_raw_member(path: &Path, name: &str, data: &[u8]) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        let mut builder = tar::Builder::new(fs::File::create(path)?);
        builder.append(&header, data)?;
        builder.into_inner()?;
        Ok(())
    }

    #[test]
    fn member_escaping_destination() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let part = dir.path().join("mirror_seq1_000000.tar");
        write_raw_member(&part, "publish/../../escaped.txt", b"escaped")?;
        let index = read_image_set(&part)?;

        let dest = dir.path().join("workspace/unpack");
        assert!(matches!(
            unpack_all(&index, &dest, &[]),
            Err(Error::UnsafeArchivePath(_))
        ));
        assert!(matches!(
            unpack_dir(&index, "publish", &dest),
            Err(Error::UnsafeArchivePath(_))
        ));
        assert!(!dir.path().join("workspace/escaped.txt").exists());

        assert!(matches!(
            index.unpack(Path::new("publish/../../escaped.txt"), &dest),
            Err(Error::UnsafeArchivePath(_))
        ));
        assert!(matches!(
            extract(&part, Path::new("/etc/escaped.txt"), &dest),
            Err(Error::UnsafeArchivePath(_))
        ));
        assert!(!dir.path().join("workspace/escaped.txt").exists());
        Ok(())
    }

    #[test]
    fn not_exist() {
        assert!(read_image_set(Path::new("/nonexistent/archive.tar")).is_err());
    }
}
