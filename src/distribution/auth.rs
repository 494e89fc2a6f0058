use crate::error::*;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env, fs, io, path::*};
use url::Url;

/// Environment variable overriding every other auth file
pub const REGISTRY_AUTH_FILE: &str = "REGISTRY_AUTH_FILE";

/// Registry credentials in the `auths` format shared by docker and podman
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryAuth {
    auths: HashMap<String, Credential>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Credential {
    /// base64 of `user:password`
    auth: String,
}

impl RegistryAuth {
    /// Load credentials of docker, then podman, then [REGISTRY_AUTH_FILE].
    ///
    /// Later files take precedence for the same registry.
    pub fn load_all() -> Result<Self> {
        let mut auth = RegistryAuth::default();
        let paths = [docker_auth_path(), podman_auth_path(), env_auth_path()];
        for path in paths.into_iter().flatten() {
            match Self::from_path(&path) {
                Ok(new) => auth.append(new),
                Err(e) => log::warn!("Ignore invalid auth file {}: {}", path.display(), e),
            }
        }
        Ok(auth)
    }

    pub fn add(&mut self, registry: &str, username: &str, password: &str) {
        let auth = STANDARD.encode(format!("{}:{}", username, password));
        self.auths.insert(registry.to_string(), Credential { auth });
    }

    pub fn append(&mut self, other: Self) {
        self.auths.extend(other.auths);
    }

    /// Encoded credential for a registry host.
    ///
    /// Keys may be a bare host, a host with repository path, or an URL such as
    /// `https://index.docker.io/v1/`.
    pub fn credential(&self, host: &str) -> Option<&str> {
        let host = normalize_host(host);
        self.auths
            .iter()
            .find(|(key, _)| normalize_host(key) == host)
            .map(|(_, cred)| cred.auth.as_str())
    }

    /// `Authorization` header value answering the challenge of `host`
    pub fn authorize(&self, host: &str, challenge: &Challenge) -> Result<String> {
        match challenge {
            Challenge::Basic => {
                let cred = self
                    .credential(host)
                    .ok_or_else(|| Error::UnSupportedAuthHeader(format!("no credential for {}", host)))?;
                Ok(format!("Basic {}", cred))
            }
            Challenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let token = self.bearer_token(host, realm, service.as_deref(), scope.as_deref())?;
                Ok(format!("Bearer {}", token))
            }
        }
    }

    fn bearer_token(
        &self,
        host: &str,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
    ) -> Result<String> {
        let token_url = Url::parse(realm)?;
        let mut req = ureq::get(token_url.as_str()).set("Accept", "application/json");
        if let Some(cred) = self.credential(host) {
            req = req.set("Authorization", &format!("Basic {}", cred));
        }
        if let Some(service) = service {
            req = req.query("service", service);
        }
        if let Some(scope) = scope {
            req = req.query("scope", scope);
        }
        match req.call() {
            Ok(res) => {
                let token = res.into_json::<Token>()?;
                token
                    .token
                    .or(token.access_token)
                    .ok_or_else(|| Error::AuthorizationFailed(token_url))
            }
            Err(ureq::Error::Status(..)) => Err(Error::AuthorizationFailed(token_url)),
            Err(ureq::Error::Transport(e)) => Err(Error::NetworkError(e.into())),
        }
    }

    fn from_path(path: &Path) -> Result<Self> {
        if path.is_file() {
            let f = fs::File::open(path)?;
            Ok(serde_json::from_reader(io::BufReader::new(f))?)
        } else {
            Ok(Self::default())
        }
    }
}

/// Host part of an auth file key, with docker hub aliases folded
fn normalize_host(key: &str) -> &str {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = key.split('/').next().unwrap_or(key);
    match host {
        "index.docker.io" | "registry-1.docker.io" => "docker.io",
        host => host,
    }
}

fn env_auth_path() -> Option<PathBuf> {
    env::var_os(REGISTRY_AUTH_FILE).map(PathBuf::from)
}

fn docker_auth_path() -> Option<PathBuf> {
    let dirs = directories::BaseDirs::new()?;
    Some(dirs.home_dir().join(".docker/config.json"))
}

fn podman_auth_path() -> Option<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "containers")?;
    Some(dirs.runtime_dir()?.join("auth.json"))
}

/// `WWW-Authenticate` challenge of a registry
///
/// ```
/// use ocmirror::distribution::Challenge;
///
/// let challenge = Challenge::from_header(
///   r#"Bearer realm="https://quay.io/v2/auth",service="quay.io",scope="repository:openshift/release:pull,push""#,
/// ).unwrap();
///
/// assert_eq!(challenge, Challenge::Bearer {
///   realm: "https://quay.io/v2/auth".to_string(),
///   service: Some("quay.io".to_string()),
///   scope: Some("repository:openshift/release:pull,push".to_string()),
/// });
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    pub fn from_header(header: &str) -> Result<Self> {
        let err = || Error::UnSupportedAuthHeader(header.to_string());
        let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Ok(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(err());
        }

        let params = parse_params(params).ok_or_else(err)?;
        let realm = params.get("realm").cloned().ok_or_else(err)?;
        Ok(Challenge::Bearer {
            realm,
            service: params.get("service").cloned(),
            scope: params.get("scope").cloned(),
        })
    }
}

/// Parse `key="value",key=value` where quoted values may contain commas
fn parse_params(input: &str) -> Option<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let (key, tail) = rest.split_once('=')?;
        let key = key.trim().to_ascii_lowercase();
        let (value, tail) = match tail.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            }
            None => match tail.find(',') {
                Some(end) => (&tail[..end], &tail[end..]),
                None => (tail, ""),
            },
        };
        params.insert(key, value.to_string());
        rest = tail.trim_start().trim_start_matches(',').trim_start();
    }
    Some(params)
}

impl TryFrom<ureq::Error> for Challenge {
    type Error = Error;
    fn try_from(e: ureq::Error) -> Result<Self> {
        match e {
            ureq::Error::Status(401, res) => match res.header("www-authenticate") {
                Some(header) => Challenge::from_header(header),
                None => Err(Error::UnSupportedAuthHeader(String::new())),
            },
            e => Err(e.into()),
        }
    }
}

#[derive(Deserialize)]
struct Token {
    token: Option<String>,
    access_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_lookup() -> Result<()> {
        let auth: RegistryAuth = serde_json::from_str(
            r#"{
                "auths": {
                    "https://index.docker.io/v1/": { "auth": "ZG9ja2VyOmh1Yg==" },
                    "quay.io/openshift-release-dev": { "auth": "cXVheTpwYXNz" }
                }
            }"#,
        )?;
        assert_eq!(auth.credential("docker.io"), Some("ZG9ja2VyOmh1Yg=="));
        assert_eq!(auth.credential("quay.io"), Some("cXVheTpwYXNz"));
        assert_eq!(auth.credential("localhost:5000"), None);
        Ok(())
    }

    #[test]
    fn later_file_wins() {
        let mut auth = RegistryAuth::default();
        auth.add("localhost:5000", "user", "old");
        let mut other = RegistryAuth::default();
        other.add("localhost:5000", "user", "pass");
        auth.append(other);
        assert_eq!(auth.credential("localhost:5000"), Some("dXNlcjpwYXNz"));
    }

    #[test]
    fn basic_challenge() -> Result<()> {
        assert_eq!(
            Challenge::from_header(r#"Basic realm="Registry Realm""#)?,
            Challenge::Basic
        );

        let mut auth = RegistryAuth::default();
        assert!(auth.authorize("localhost:5000", &Challenge::Basic).is_err());
        auth.add("localhost:5000", "user", "pass");
        assert_eq!(
            auth.authorize("localhost:5000", &Challenge::Basic)?,
            "Basic dXNlcjpwYXNz"
        );
        Ok(())
    }

    #[test]
    fn bearer_without_scope() -> Result<()> {
        assert_eq!(
            Challenge::from_header(r#"Bearer realm="https://auth.docker.io/token",service=registry.docker.io"#)?,
            Challenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: None,
            }
        );
        assert!(Challenge::from_header(r#"Bearer service="quay.io""#).is_err());
        assert!(Challenge::from_header("Digest realm=\"x\"").is_err());
        Ok(())
    }
}
