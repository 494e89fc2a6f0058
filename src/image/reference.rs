use crate::{
    distribution::{Name, Reference},
    error::*,
    Digest,
};
use std::{fmt, str::FromStr};
use url::Url;

/// Where an image reference points to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    /// `docker://`, or no prefix
    Registry,
    /// `file://`, an image stored in the `v2/` tree of a workspace
    File,
}

/// Reference to an image, `[transport://][registry/][namespace/]name[:tag][@digest]`
///
/// ```
/// use ocmirror::image::{ImageReference, Transport};
///
/// let r = ImageReference::parse("quay.io/openshift-release-dev/ocp-release:4.9.5-x86_64").unwrap();
/// assert_eq!(r.transport, Transport::Registry);
/// assert_eq!(r.registry, "quay.io");
/// assert_eq!(r.namespace, "openshift-release-dev");
/// assert_eq!(r.name, "ocp-release");
/// assert_eq!(r.tag.as_deref(), Some("4.9.5-x86_64"));
///
/// let r = ImageReference::parse("file://openshift/release:4.9.5-x86_64").unwrap();
/// assert_eq!(r.transport, Transport::File);
/// assert_eq!(r.registry, "");
/// assert_eq!(r.path(), "openshift/release");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageReference {
    pub transport: Transport,
    /// `host[:port]`, empty if not specified
    pub registry: String,
    /// Slash separated namespace, may be empty
    pub namespace: String,
    pub name: String,
    pub tag: Option<String>,
    pub id: Option<Digest>,
}

impl ImageReference {
    pub fn parse(input: &str) -> Result<Self> {
        let err = || Error::InvalidReference(input.to_string());
        let (transport, rest) = if let Some(rest) = input.strip_prefix("file://") {
            (Transport::File, rest)
        } else if let Some(rest) = input.strip_prefix("docker://") {
            (Transport::Registry, rest)
        } else {
            (Transport::Registry, input)
        };

        let (rest, id) = match rest.split_once('@') {
            Some((rest, digest)) => (rest, Some(Digest::new(digest)?)),
            None => (rest, None),
        };

        let slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (rest, tag) = match rest[slash..].rfind(':') {
            Some(i) => {
                let tag = &rest[slash + i + 1..];
                if !Reference::is_tag(tag) {
                    return Err(err());
                }
                (&rest[..slash + i], Some(tag.to_string()))
            }
            None => (rest, None),
        };

        let mut components: Vec<&str> = rest.split('/').collect();
        let registry = if transport == Transport::Registry
            && components.len() > 1
            && is_registry_host(components[0])
        {
            components.remove(0).to_string()
        } else {
            String::new()
        };
        let name = components.pop().filter(|name| !name.is_empty()).ok_or_else(err)?;
        let reference = ImageReference {
            transport,
            registry,
            namespace: components.join("/"),
            name: name.to_string(),
            tag,
            id,
        };
        reference.repository().map_err(|_| err())?;
        Ok(reference)
    }

    /// Reference to `path` under a registry root such as `localhost:5000/namespace`
    pub fn under(root: &str, path: &str) -> Result<Self> {
        let reference = Self::parse(&format!(
            "{}/{}",
            root.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))?;
        if reference.registry.is_empty() || reference.transport != Transport::Registry {
            return Err(Error::NotARegistry(root.to_string()));
        }
        Ok(reference)
    }

    /// `namespace/name` part
    pub fn path(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    /// Repository name used in `/v2/<name>/` API
    pub fn repository(&self) -> Result<Name> {
        Name::new(&self.path())
    }

    /// Reference to the manifest, prefers digest over tag
    pub fn manifest_reference(&self) -> Reference {
        match (&self.id, &self.tag) {
            (Some(id), _) => Reference::Digest(id.clone()),
            (None, Some(tag)) => Reference::Tag(tag.clone()),
            (None, None) => Reference::Tag("latest".to_string()),
        }
    }

    /// The fully qualified reference without transport
    pub fn exact(&self) -> String {
        let mut out = String::new();
        if !self.registry.is_empty() {
            out.push_str(&self.registry);
            out.push('/');
        }
        out.push_str(&self.path());
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(id) = &self.id {
            out.push('@');
            out.push_str(&id.to_string());
        }
        out
    }

    /// Set a tag if missing, derived from the digest or `latest`
    pub fn set_defaults(mut self) -> Self {
        if self.tag.is_none() {
            self.tag = Some(match &self.id {
                Some(id) => id.partial().to_string(),
                None => "latest".to_string(),
            });
        }
        self
    }

    /// Is this reference pinned by digest
    pub fn is_pinned(&self) -> bool {
        self.id.is_some()
    }

    /// URL of the registry API endpoint, over plain HTTP for `plain_http` or `localhost`
    pub fn registry_url(&self, plain_http: bool) -> Result<Url> {
        if self.registry.is_empty() || self.transport != Transport::Registry {
            return Err(Error::NotARegistry(self.to_string()));
        }
        let scheme = if plain_http || self.registry.starts_with("localhost") {
            "http"
        } else {
            "https"
        };
        Ok(Url::parse(&format!("{}://{}", scheme, self.registry))?)
    }
}

fn is_registry_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport {
            Transport::Registry => write!(f, "{}", self.exact()),
            Transport::File => write!(f, "file://{}", self.exact()),
        }
    }
}

impl FromStr for ImageReference {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        ImageReference::parse(s)
    }
}
