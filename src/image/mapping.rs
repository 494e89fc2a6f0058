use crate::{
    error::*,
    image::{ImageReference, ImageType, Transport},
};
use std::{
    collections::{btree_map, BTreeMap},
    fs,
    io::{self, BufRead, Write},
    path::Path,
};

/// Image reference tagged with its content type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypedImage {
    pub reference: ImageReference,
    pub category: ImageType,
}

impl TypedImage {
    pub fn new(reference: ImageReference, category: ImageType) -> Self {
        TypedImage {
            reference,
            category,
        }
    }

    /// Parse a reference, filling a default tag
    pub fn parse(image: &str, category: ImageType) -> Result<Self> {
        let reference = ImageReference::parse(image)?.set_defaults();
        Ok(TypedImage {
            reference,
            category,
        })
    }
}

/// Source to destination mapping of typed images
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypedImageMapping(BTreeMap<TypedImage, TypedImage>);

impl TypedImageMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite
    pub fn add(&mut self, src: TypedImage, dest: TypedImage) {
        self.0.insert(src, dest);
    }

    /// Add entries of `other` whose source is not registered yet
    pub fn merge(&mut self, other: TypedImageMapping) {
        for (src, dest) in other.0 {
            match self.0.entry(src) {
                btree_map::Entry::Occupied(entry) => {
                    log::debug!("source image {} already exists in mapping", entry.key().reference);
                }
                btree_map::Entry::Vacant(entry) => {
                    entry.insert(dest);
                }
            }
        }
    }

    pub fn remove(&mut self, images: &[TypedImage]) {
        for image in images {
            self.0.remove(image);
        }
    }

    pub fn get(&self, src: &TypedImage) -> Option<&TypedImage> {
        self.0.get(src)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, TypedImage, TypedImage> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Point every destination to `registry/namespace/<path>`, keeping the source digest
    pub fn to_registry(&mut self, registry: &str, namespace: &str) {
        for (src, dest) in self.0.iter_mut() {
            let reference = &mut dest.reference;
            reference.transport = Transport::Registry;
            reference.registry = registry.to_string();
            reference.namespace = [namespace, reference.namespace.as_str()]
                .iter()
                .filter(|s| !s.is_empty())
                .copied()
                .collect::<Vec<_>>()
                .join("/");
            reference.id = src.reference.id.clone();
            *reference = reference.clone().set_defaults();
        }
    }
}

impl IntoIterator for TypedImageMapping {
    type Item = (TypedImage, TypedImage);
    type IntoIter = btree_map::IntoIter<TypedImage, TypedImage>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(TypedImage, TypedImage)> for TypedImageMapping {
    fn from_iter<I: IntoIterator<Item = (TypedImage, TypedImage)>>(iter: I) -> Self {
        TypedImageMapping(iter.into_iter().collect())
    }
}

/// Entries whose source category is one of `types`
pub fn by_category(mapping: &TypedImageMapping, types: &[ImageType]) -> TypedImageMapping {
    mapping
        .iter()
        .filter(|(src, _)| types.contains(&src.category))
        .map(|(src, dest)| (src.clone(), dest.clone()))
        .collect()
}

/// Read `src<separator>dst` lines
pub fn read_image_mapping(
    path: &Path,
    separator: &str,
    category: ImageType,
) -> Result<TypedImageMapping> {
    let f = fs::File::open(path)?;
    let mut mapping = TypedImageMapping::new();
    for line in io::BufReader::new(f).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let split: Vec<&str> = line.split(separator).collect();
        if split.len() != 2 {
            return Err(Error::InvalidReference(format!(
                "mapping {:?} expected to have exactly one {:?}",
                line, separator
            )));
        }
        mapping.add(
            TypedImage::parse(split[0].trim(), category)?,
            TypedImage::parse(split[1].trim(), category)?,
        );
    }
    Ok(mapping)
}

/// Write the mapping as `src=dst` lines
pub fn write_image_mapping(mapping: &TypedImageMapping, path: &Path) -> Result<()> {
    let mut f = io::BufWriter::new(fs::File::create(path)?);
    for (src, dest) in mapping.iter() {
        writeln!(f, "{}={}", src.reference, dest.reference)?;
    }
    f.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typed(image: &str, category: ImageType) -> TypedImage {
        TypedImage::parse(image, category).unwrap()
    }

    fn sample() -> TypedImageMapping {
        let mut mapping = TypedImageMapping::new();
        mapping.add(
            typed("quay.io/openshift-release-dev/ocp-release:4.9.5-x86_64", ImageType::OcpRelease),
            typed("file://openshift/release:4.9.5-x86_64", ImageType::OcpRelease),
        );
        mapping.add(
            typed("registry.redhat.io/ubi8/ubi:latest", ImageType::Generic),
            typed("file://ubi8/ubi:latest", ImageType::Generic),
        );
        mapping.add(
            typed("registry.redhat.io/redhat/redhat-operator-index:v4.9", ImageType::OperatorCatalog),
            typed("file://redhat/redhat-operator-index:v4.9", ImageType::OperatorCatalog),
        );
        mapping
    }

    #[test]
    fn filter_by_category() {
        let mapping = sample();
        let releases = by_category(&mapping, &[ImageType::OcpRelease]);
        assert_eq!(releases.len(), 1);
        assert!(releases.iter().all(|(src, _)| src.category == ImageType::OcpRelease));

        let both = by_category(&mapping, &[ImageType::OcpRelease, ImageType::Generic]);
        assert_eq!(both.len(), 2);
        assert!(by_category(&mapping, &[ImageType::OperatorBundle]).is_empty());
    }

    #[test]
    fn merge_first_wins() {
        let mut mapping = sample();
        let src = typed("registry.redhat.io/ubi8/ubi:latest", ImageType::Generic);
        let mut other = TypedImageMapping::new();
        other.add(src.clone(), typed("file://other/ubi:latest", ImageType::Generic));
        other.add(
            typed("quay.io/new/image:v1", ImageType::Generic),
            typed("file://new/image:v1", ImageType::Generic),
        );
        mapping.merge(other);
        assert_eq!(mapping.len(), 4);
        assert_eq!(
            mapping.get(&src).unwrap().reference.path(),
            "ubi8/ubi"
        );

        // add overwrites
        mapping.add(src.clone(), typed("file://other/ubi:latest", ImageType::Generic));
        assert_eq!(mapping.get(&src).unwrap().reference.path(), "other/ubi");

        mapping.remove(&[src.clone()]);
        assert!(mapping.get(&src).is_none());
    }

    #[test]
    fn to_registry() {
        let mut mapping = sample();
        mapping.to_registry("localhost:5000", "mirror");
        for (_, dest) in mapping.iter() {
            assert_eq!(dest.reference.transport, Transport::Registry);
            assert_eq!(dest.reference.registry, "localhost:5000");
            assert!(dest.reference.namespace.starts_with("mirror/"));
        }
    }

    #[test]
    fn read_write() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mapping.txt");
        fs::write(
            &path,
            "quay.io/ubi8/ubi:latest=file://ubi8/ubi:latest\n\nquay.io/ubi8/minimal=file://ubi8/minimal\n",
        )?;
        let mapping = read_image_mapping(&path, "=", ImageType::Generic)?;
        assert_eq!(mapping.len(), 2);
        // Default tag is filled
        let src = typed("quay.io/ubi8/minimal:latest", ImageType::Generic);
        assert_eq!(
            mapping.get(&src).unwrap().reference.to_string(),
            "file://ubi8/minimal:latest"
        );

        let out = dir.path().join("out.txt");
        write_image_mapping(&mapping, &out)?;
        assert_eq!(read_image_mapping(&out, "=", ImageType::Generic)?, mapping);

        fs::write(&path, "a=b=c\n")?;
        assert!(read_image_mapping(&path, "=", ImageType::Generic).is_err());
        Ok(())
    }
}
