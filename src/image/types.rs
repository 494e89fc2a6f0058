use crate::error::*;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Content type of a mirrored image.
///
/// Serialized by its label, e.g. `"ocpRelease"`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ImageType {
    #[serde(rename = "ocpRelease")]
    OcpRelease,
    #[serde(rename = "operatorCatalog")]
    OperatorCatalog,
    #[serde(rename = "operatorBundle")]
    OperatorBundle,
    #[serde(rename = "operatorRelatedImage")]
    OperatorRelatedImage,
    #[serde(rename = "generic")]
    Generic,
}

impl ImageType {
    pub const ALL: [ImageType; 5] = [
        ImageType::OcpRelease,
        ImageType::OperatorCatalog,
        ImageType::OperatorBundle,
        ImageType::OperatorRelatedImage,
        ImageType::Generic,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ImageType::OcpRelease => "ocpRelease",
            ImageType::OperatorCatalog => "operatorCatalog",
            ImageType::OperatorBundle => "operatorBundle",
            ImageType::OperatorRelatedImage => "operatorRelatedImage",
            ImageType::Generic => "generic",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ImageType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        ImageType::ALL
            .into_iter()
            .find(|ty| ty.label() == s)
            .ok_or_else(|| Error::InvalidImageType(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_match_serde() -> Result<()> {
        for ty in ImageType::ALL {
            let json = serde_json::to_string(&ty)?;
            assert_eq!(json, format!("\"{}\"", ty.label()));
            assert_eq!(ty.label().parse::<ImageType>()?, ty);
        }
        assert!("invalid".parse::<ImageType>().is_err());
        Ok(())
    }
}
