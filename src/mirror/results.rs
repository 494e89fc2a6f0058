//! Cluster resources pointing pulls to the mirror, written after a publish
//!
//! ```text
//! <output_dir>/mapping.txt                      source=destination of each published image
//! <output_dir>/imageContentSourcePolicy.yaml    one policy per kind of content
//! <output_dir>/catalogSource-<name>.yaml        one for each rebuilt catalog
//! ```

use crate::{
    error::*,
    image::{write_image_mapping, ImageReference, ImageType, TypedImageMapping},
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

pub const MAPPING_FILE: &str = "mapping.txt";
pub const ICSP_FILE: &str = "imageContentSourcePolicy.yaml";

const ICSP_API_VERSION: &str = "operator.openshift.io/v1alpha1";
const CATALOG_SOURCE_API_VERSION: &str = "operators.coreos.com/v1alpha1";
const MARKETPLACE_NAMESPACE: &str = "openshift-marketplace";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Redirects pulls by digest from source repositories to their mirrors
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageContentSourcePolicy {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ImageContentSourcePolicySpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageContentSourcePolicySpec {
    pub repository_digest_mirrors: Vec<RepositoryDigestMirrors>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryDigestMirrors {
    pub source: String,
    pub mirrors: Vec<String>,
}

/// Makes a mirrored operator catalog available to the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSource {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: CatalogSourceSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSourceSpec {
    pub source_type: String,
    pub image: String,
}

/// Prefix of the policy name. Catalogs get a [CatalogSource] instead.
fn policy_name(category: ImageType) -> Option<&'static str> {
    match category {
        ImageType::OcpRelease => Some("release"),
        ImageType::Generic => Some("generic"),
        ImageType::OperatorBundle | ImageType::OperatorRelatedImage => Some("operator"),
        ImageType::OperatorCatalog => None,
    }
}

/// `registry/namespace/name` without tag or digest
fn repository(image: &ImageReference) -> String {
    if image.registry.is_empty() {
        image.path()
    } else {
        format!("{}/{}", image.registry, image.path())
    }
}

pub fn image_content_source_policies(mapping: &TypedImageMapping) -> Vec<ImageContentSourcePolicy> {
    let mut groups: BTreeMap<&str, BTreeMap<String, BTreeSet<String>>> = BTreeMap::new();
    for (src, dest) in mapping.iter() {
        if let Some(name) = policy_name(src.category) {
            groups
                .entry(name)
                .or_default()
                .entry(repository(&src.reference))
                .or_default()
                .insert(repository(&dest.reference));
        }
    }
    groups
        .into_iter()
        .map(|(name, repositories)| ImageContentSourcePolicy {
            api_version: ICSP_API_VERSION.to_string(),
            kind: "ImageContentSourcePolicy".to_string(),
            metadata: ObjectMeta {
                name: format!("{}-0", name),
                namespace: None,
            },
            spec: ImageContentSourcePolicySpec {
                repository_digest_mirrors: repositories
                    .into_iter()
                    .map(|(source, mirrors)| RepositoryDigestMirrors {
                        source,
                        mirrors: mirrors.into_iter().collect(),
                    })
                    .collect(),
            },
        })
        .collect()
}

/// Kubernetes object name from the catalog repository name
fn catalog_source_name(image: &ImageReference) -> String {
    let name: String = image
        .name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    name.trim_matches('-').to_string()
}

pub fn catalog_sources(mapping: &TypedImageMapping) -> Vec<CatalogSource> {
    mapping
        .iter()
        .filter(|(src, _)| src.category == ImageType::OperatorCatalog)
        .map(|(_, dest)| CatalogSource {
            api_version: CATALOG_SOURCE_API_VERSION.to_string(),
            kind: "CatalogSource".to_string(),
            metadata: ObjectMeta {
                name: catalog_source_name(&dest.reference),
                namespace: Some(MARKETPLACE_NAMESPACE.to_string()),
            },
            spec: CatalogSourceSpec {
                source_type: "grpc".to_string(),
                image: dest.reference.exact(),
            },
        })
        .collect()
}

fn yaml_documents<T: Serialize>(docs: &[T]) -> Result<String> {
    let mut out = String::new();
    for doc in docs {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(doc)?);
    }
    Ok(out)
}

/// Write the mapping and the resources derived from it into `dir`, returning the written files
pub fn write_results(mapping: &TypedImageMapping, dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();

    let path = dir.join(MAPPING_FILE);
    write_image_mapping(mapping, &path)?;
    written.push(path);

    let policies = image_content_source_policies(mapping);
    if !policies.is_empty() {
        let path = dir.join(ICSP_FILE);
        fs::write(&path, yaml_documents(&policies)?)?;
        written.push(path);
    }

    for source in catalog_sources(mapping) {
        let path = dir.join(format!("catalogSource-{}.yaml", source.metadata.name));
        fs::write(&path, serde_yaml::to_string(&source)?)?;
        written.push(path);
    }
    Ok(written)
}
