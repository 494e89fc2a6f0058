//! Workspace layout and the image set configuration

use crate::error::*;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::*};

pub const PROJECT_NAME: &str = "ocmirror";

pub const SOURCE_DIR: &str = "src";
pub const PUBLISH_DIR: &str = "publish";
pub const INTERNAL_DIR: &str = "internal";
pub const CATALOGS_DIR: &str = "catalogs";
pub const HELM_DIR: &str = "charts";
pub const V2_DIR: &str = "v2";
pub const BLOB_DIR: &str = "blobs";
pub const MANIFEST_DIR: &str = "manifests";
pub const METADATA_FILE: &str = ".metadata.json";
pub const ASSOCIATIONS_FILE: &str = "image-associations";
pub const LOG_FILE: &str = ".oc-mirror.log";

/// Default upstream update graph
pub const UPDATE_URL: &str = "https://api.openshift.com/api/upgrades_info/v1/graph";
/// Update graph of OKD releases, queried for the [OKD_CHANNEL] channel
pub const OKD_UPDATE_URL: &str = "https://amd64.origin.releases.ci.openshift.org/graph";
pub const OKD_CHANNEL: &str = "okd";

/// `publish/.metadata.json`, relative to a workspace or backend root
pub fn metadata_base_path() -> PathBuf {
    Path::new(PUBLISH_DIR).join(METADATA_FILE)
}

/// `internal/image-associations`, relative to a workspace root
pub fn associations_base_path() -> PathBuf {
    Path::new(INTERNAL_DIR).join(ASSOCIATIONS_FILE)
}

/// Project root data directory, used as default workspace
pub fn data_dir() -> Result<PathBuf> {
    let p = ProjectDirs::from("", PROJECT_NAME, PROJECT_NAME)
        .ok_or(Error::NoValidRuntimeDirectory)?;
    Ok(p.data_dir().to_owned())
}

/// Requested content of an image set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSetConfiguration {
    #[serde(default)]
    pub mirror: Mirror,
    #[serde(default)]
    pub storage_config: StorageConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mirror {
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub operators: Vec<Operator>,
    #[serde(default)]
    pub additional_images: Vec<Image>,
    /// Images never mirrored, matched by the last component of their repository
    #[serde(default)]
    pub blocked_images: Vec<Image>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    #[serde(default)]
    pub channels: Vec<ReleaseChannel>,
    /// Update graph endpoint, [UPDATE_URL] if not set. The `okd` channel always uses [OKD_UPDATE_URL].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseChannel {
    pub name: String,
    /// Versions to mirror. The latest of the channel is used if empty.
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub min_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub max_version: String,
    #[serde(default)]
    pub heads_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub catalog: String,
    #[serde(default)]
    pub heads_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    pub image_url: String,
    #[serde(default)]
    pub skip_tls: bool,
}

impl ImageSetConfiguration {
    pub fn from_toml(input: &str) -> Result<Self> {
        Ok(toml::from_str(input)?)
    }

    pub fn from_json(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn validate(&self) -> Result<()> {
        for channel in &self.mirror.platform.channels {
            if channel.name.is_empty() {
                return Err(Error::InvalidConfig(
                    "release channel name must not be empty".to_string(),
                ));
            }
            let bounds = [&channel.min_version, &channel.max_version];
            for version in channel.versions.iter().chain(bounds) {
                if !version.is_empty() {
                    semver::Version::parse(version)?;
                }
            }
        }
        for operator in &self.mirror.operators {
            if operator.catalog.is_empty() {
                return Err(Error::InvalidConfig(
                    "operator catalog must not be empty".to_string(),
                ));
            }
        }
        if self.storage_config.local.is_some() && self.storage_config.registry.is_some() {
            return Err(Error::InvalidConfig(
                "only one storage backend can be configured".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from a TOML or JSON file, chosen by extension
pub fn load_config(path: &Path) -> Result<ImageSetConfiguration> {
    if !path.is_file() {
        return Err(Error::NotAFile(path.to_owned()));
    }
    let input = fs::read_to_string(path)?;
    let cfg = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => ImageSetConfiguration::from_json(&input)?,
        _ => ImageSetConfiguration::from_toml(&input)?,
    };
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML: &str = r#"
[mirror]
additionalImages = [{ name = "registry.redhat.io/ubi8/ubi:latest" }]
blockedImages = [{ name = "alpine" }]

[[mirror.platform.channels]]
name = "stable-4.9"
versions = ["4.9.5"]
headsOnly = true

[[mirror.operators]]
catalog = "registry.redhat.io/redhat/redhat-operator-index:v4.9"

[storageConfig.local]
path = "/tmp/metadata"
"#;

    #[test]
    fn load_toml() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("imageset-config.toml");
        fs::write(&path, TOML)?;
        let cfg = load_config(&path)?;
        assert_eq!(cfg.mirror.platform.channels[0].name, "stable-4.9");
        assert!(cfg.mirror.platform.channels[0].heads_only);
        assert_eq!(cfg.mirror.additional_images.len(), 1);
        assert_eq!(
            cfg.mirror.blocked_images,
            vec![Image {
                name: "alpine".to_string()
            }]
        );
        assert_eq!(
            cfg.storage_config.local,
            Some(LocalConfig {
                path: PathBuf::from("/tmp/metadata")
            })
        );
        Ok(())
    }

    #[test]
    fn load_json() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("imageset-config.json");
        fs::write(
            &path,
            r#"{"mirror":{"platform":{"channels":[{"name":"stable-4.9"}]}}}"#,
        )?;
        let cfg = load_config(&path)?;
        assert!(cfg.mirror.platform.channels[0].versions.is_empty());
        assert!(load_config(&dir.path().join("missing.json")).is_err());
        Ok(())
    }

    #[test]
    fn validate() -> Result<()> {
        let mut cfg = ImageSetConfiguration::from_toml(TOML)?;
        cfg.validate()?;

        cfg.mirror.platform.channels[0].versions.push("4.9".to_string());
        assert!(cfg.validate().is_err());
        cfg.mirror.platform.channels[0].versions.pop();

        cfg.storage_config.registry = Some(RegistryConfig {
            image_url: "localhost:5000/metadata:latest".to_string(),
            skip_tls: false,
        });
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        let empty = ImageSetConfiguration::from_toml(
            r#"
[[mirror.platform.channels]]
name = ""
"#,
        )?;
        assert!(empty.validate().is_err());
        Ok(())
    }

    #[test]
    fn paths() {
        assert_eq!(
            metadata_base_path(),
            PathBuf::from("publish/.metadata.json")
        );
        assert_eq!(
            associations_base_path(),
            PathBuf::from("internal/image-associations")
        );
    }
}
