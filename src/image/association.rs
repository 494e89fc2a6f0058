use crate::{
    config::{MANIFEST_DIR, V2_DIR},
    error::*,
    image::{ImageReference, ImageType, TypedImageMapping},
    Digest,
};
use oci_spec::image::{ImageIndex, ImageManifest};
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map, BTreeMap},
    fs,
    io::{self, Read, Write},
    path::Path,
};

/// Node of an image content graph
///
/// ```
/// use ocmirror::{image::{Association, ImageType, Node}, Digest};
///
/// let layer = Digest::from_buf_sha256(b"layer");
/// let assoc = Association {
///     name: "quay.io/ubi8/ubi:latest".to_string(),
///     path: "ubi8/ubi".to_string(),
///     id: Digest::from_buf_sha256(b"manifest"),
///     tag_symlink: Some("latest".to_string()),
///     image_type: ImageType::Generic,
///     node: Node::Layers(vec![layer.clone()]),
/// };
/// assert_eq!(assoc.layers(), &[layer]);
/// assert!(assoc.manifests().is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    /// Logical image reference
    pub name: String,
    /// Location of the image under `v2/`
    pub path: String,
    /// Digest of the manifest of this node
    pub id: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_symlink: Option<String>,
    #[serde(rename = "type")]
    pub image_type: ImageType,
    #[serde(flatten)]
    pub node: Node,
}

/// Children of an [Association], either manifests of an index or blobs of a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Node {
    Manifests(Vec<Digest>),
    Layers(Vec<Digest>),
}

impl Association {
    pub fn manifests(&self) -> &[Digest] {
        match &self.node {
            Node::Manifests(digests) => digests,
            Node::Layers(_) => &[],
        }
    }

    pub fn layers(&self) -> &[Digest] {
        match &self.node {
            Node::Layers(digests) => digests,
            Node::Manifests(_) => &[],
        }
    }
}

/// Associations of every mirrored image, keyed by the top-level image and then by manifest digest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssociationSet(BTreeMap<String, BTreeMap<Digest, Association>>);

impl AssociationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &str, assoc: Association) {
        self.0
            .entry(key.to_string())
            .or_default()
            .insert(assoc.id.clone(), assoc);
    }

    /// Union with `other`, entries of `other` win on the same key and digest
    pub fn merge(&mut self, other: AssociationSet) {
        for (key, values) in other.0 {
            self.0.entry(key).or_default().extend(values);
        }
    }

    /// Move all associations under `old` to `new`
    pub fn rekey(&mut self, old: &str, new: &str) -> Result<()> {
        let values = self
            .0
            .remove(old)
            .ok_or_else(|| Error::MissingAssociationKey(old.to_string()))?;
        self.0.entry(new.to_string()).or_default().extend(values);
        Ok(())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|key| key.as_str())
    }

    pub fn search(&self, key: &str) -> Option<&BTreeMap<Digest, Association>> {
        self.0.get(key)
    }

    pub fn get(&self, key: &str, digest: &Digest) -> Option<&Association> {
        self.0.get(key)?.get(digest)
    }

    pub fn contains_key(&self, key: &str, digest: &Digest) -> bool {
        self.get(key, digest).is_some()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, BTreeMap<Digest, Association>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All blob digests with the path of the image referring them
    pub fn layers(&self) -> impl Iterator<Item = (&str, &Digest)> {
        self.0
            .values()
            .flat_map(|values| values.values())
            .flat_map(|assoc| assoc.layers().iter().map(move |d| (assoc.path.as_str(), d)))
    }

    /// Every manifest referenced from an index must have its own entry under the same key
    pub fn validate(&self) -> Result<()> {
        for (key, values) in &self.0 {
            for assoc in values.values() {
                if let Some(digest) = assoc
                    .manifests()
                    .iter()
                    .find(|digest| !values.contains_key(*digest))
                {
                    return Err(Error::MissingManifest {
                        image: key.clone(),
                        digest: digest.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn encode<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn decode<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(io::BufReader::new(reader))?)
    }

    pub fn read(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::NotAFile(path.to_owned()));
        }
        Self::decode(fs::File::open(path)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = io::BufWriter::new(fs::File::create(path)?);
        self.encode(&mut f)?;
        f.flush()?;
        Ok(())
    }
}

impl IntoIterator for AssociationSet {
    type Item = (String, BTreeMap<Digest, Association>);
    type IntoIter = btree_map::IntoIter<String, BTreeMap<Digest, Association>>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Build associations of `images` from manifests stored under `root/v2/`
///
/// `mapping` gives the `file://` destination of each source image,
/// which is where the manifests have been written by a mirror-to-disk.
pub fn associate_image_layers(
    root: &Path,
    mapping: &TypedImageMapping,
    images: &[String],
    image_type: ImageType,
) -> Result<AssociationSet> {
    let mut assocs = AssociationSet::new();
    let mut errs = Vec::new();
    for image in images {
        if let Err(e) = associate_image(root, mapping, image, image_type, &mut assocs) {
            errs.push(e);
        }
    }
    Error::aggregate(errs)?;
    Ok(assocs)
}

fn associate_image(
    root: &Path,
    mapping: &TypedImageMapping,
    image: &str,
    image_type: ImageType,
    assocs: &mut AssociationSet,
) -> Result<()> {
    let source = ImageReference::parse(image)?.set_defaults();
    let (_, dest) = mapping
        .iter()
        .find(|(src, _)| src.reference == source)
        .ok_or_else(|| Error::NotFound(format!("image {} in mapping", image)))?;
    let dest = &dest.reference;
    let path = dest.path();
    let manifest_dir = root.join(V2_DIR).join(&path).join(MANIFEST_DIR);

    let file_name = match (&dest.tag, &dest.id) {
        (Some(tag), _) => tag.clone(),
        (None, Some(id)) => id.to_string(),
        (None, None) => return Err(Error::InvalidReference(dest.to_string())),
    };
    let buf = fs::read(manifest_dir.join(&file_name))?;
    let id = match &dest.id {
        Some(id) => id.clone(),
        None => Digest::from_buf_sha256(&buf),
    };

    let node = parse_node(&buf)?;
    if let Node::Manifests(children) = &node {
        for child in children {
            let buf = fs::read(manifest_dir.join(child.to_string()))?;
            let node = parse_node(&buf)?;
            if let Node::Manifests(_) = node {
                return Err(Error::InvalidReference(format!(
                    "nested index {} in {}",
                    child, image
                )));
            }
            assocs.add(
                image,
                Association {
                    name: child.to_string(),
                    path: path.clone(),
                    id: child.clone(),
                    tag_symlink: None,
                    image_type,
                    node,
                },
            );
        }
    }
    assocs.add(
        image,
        Association {
            name: image.to_string(),
            path,
            id,
            tag_symlink: dest.tag.clone(),
            image_type,
            node,
        },
    );
    Ok(())
}

/// Parse OCI or docker index/manifest into the children it refers to
fn parse_node(buf: &[u8]) -> Result<Node> {
    let value: serde_json::Value = serde_json::from_slice(buf)?;
    if value.get("manifests").is_some() {
        let index = ImageIndex::from_reader(buf)?;
        let digests = index
            .manifests()
            .iter()
            .map(Digest::from_descriptor)
            .collect::<Result<Vec<_>>>()?;
        Ok(Node::Manifests(digests))
    } else {
        let manifest = ImageManifest::from_reader(buf)?;
        let mut digests = vec![Digest::from_descriptor(manifest.config())?];
        for layer in manifest.layers() {
            digests.push(Digest::from_descriptor(layer)?);
        }
        Ok(Node::Layers(digests))
    }
}
