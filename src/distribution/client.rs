use crate::{distribution::*, error::*, image::ImageReference, Context, Digest};
use oci_spec::image::*;
use std::{io::Read, sync::Arc};
use url::Url;

/// Transport security toward a registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Tls {
    #[default]
    Verify,
    /// HTTPS without certificate verification
    SkipVerify,
    /// Plain HTTP
    Disabled,
}

impl Tls {
    /// Plain HTTP wins over skipping verification
    pub fn new(plain_http: bool, skip_verify: bool) -> Self {
        match (plain_http, skip_verify) {
            (true, _) => Tls::Disabled,
            (false, true) => Tls::SkipVerify,
            (false, false) => Tls::Verify,
        }
    }

    pub fn is_plain_http(&self) -> bool {
        *self == Tls::Disabled
    }

    fn agent(&self) -> Result<ureq::Agent> {
        match self {
            Tls::SkipVerify => {
                let connector = native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true)
                    .build()?;
                Ok(ureq::AgentBuilder::new()
                    .tls_connector(Arc::new(connector))
                    .build())
            }
            Tls::Verify | Tls::Disabled => Ok(ureq::Agent::new()),
        }
    }
}

/// A client for `/v2/<name>/` API endpoint
pub struct Client {
    agent: ureq::Agent,
    /// URL to registry server
    url: Url,
    /// Name of repository
    name: Name,
    /// Credentials loaded from auth files
    auth: RegistryAuth,
    /// `Authorization` header accepted by the registry
    authorization: Option<String>,
}

impl Client {
    pub fn new(url: Url, name: Name) -> Result<Self> {
        Self::with_tls(url, name, Tls::default())
    }

    pub fn with_tls(url: Url, name: Name, tls: Tls) -> Result<Self> {
        let auth = RegistryAuth::load_all()?;
        Ok(Client {
            agent: tls.agent()?,
            url,
            name,
            auth,
            authorization: None,
        })
    }

    /// Client for the repository of given image
    pub fn from_image_reference(image: &ImageReference, tls: Tls) -> Result<Self> {
        Self::with_tls(
            image.registry_url(tls.is_plain_http())?,
            image.repository()?,
            tls,
        )
    }

    pub fn add_basic_auth(&mut self, registry: &str, username: &str, password: &str) {
        self.auth.add(registry, username, password);
    }

    /// `host[:port]` of the registry, as keyed in auth files
    fn host(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    fn send(
        &mut self,
        ctx: &Context,
        req: ureq::Request,
        body: Option<&[u8]>,
    ) -> Result<ureq::Response> {
        ctx.check()?;
        let req = match ctx.remaining() {
            Some(timeout) => req.timeout(timeout),
            None => req,
        };
        let host = self.host();
        let auth = &self.auth;
        send_authorized(
            &mut self.authorization,
            |authorization| {
                let req = match authorization {
                    Some(authorization) => req.clone().set("Authorization", authorization),
                    None => req.clone(),
                };
                match body {
                    Some(body) => req.send_bytes(body),
                    None => req.call(),
                }
            },
            |challenge| auth.authorize(&host, challenge),
        )
    }

    fn get(&self, url: &Url) -> ureq::Request {
        log::info!("GET {}", url);
        self.agent.get(url.as_str())
    }

    fn head(&self, url: &Url) -> ureq::Request {
        log::debug!("HEAD {}", url);
        self.agent.head(url.as_str())
    }

    fn put(&self, url: &Url) -> ureq::Request {
        log::info!("PUT {}", url);
        self.agent.put(url.as_str())
    }

    fn post(&self, url: &Url) -> ureq::Request {
        log::info!("POST {}", url);
        self.agent.post(url.as_str())
    }

    fn delete(&self, url: &Url) -> ureq::Request {
        log::info!("DELETE {}", url);
        self.agent.delete(url.as_str())
    }

    fn location(&self, res: &ureq::Response) -> Result<Url> {
        let loc = res
            .header("Location")
            .ok_or_else(|| Error::NotFound("Location header in OCI registry response".into()))?;
        Ok(Url::parse(loc).or_else(|_| self.url.join(loc))?)
    }

    /// Get manifest for given repository
    ///
    /// ```text
    /// GET /v2/<name>/manifests/<reference>
    /// ```
    ///
    /// See [corresponding OCI distribution spec document](https://github.com/opencontainers/distribution-spec/blob/main/spec.md#pulling-manifests) for detail.
    pub fn get_manifest(&mut self, ctx: &Context, reference: &Reference) -> Result<ImageManifest> {
        let url = self
            .url
            .join(&format!("/v2/{}/manifests/{}", self.name, reference))?;
        let req = self.get(&url).set(
            "Accept",
            &format!(
                "{}, {}",
                MediaType::ImageManifest,
                "application/vnd.docker.distribution.manifest.v2+json",
            ),
        );
        let res = self.send(ctx, req, None)?;
        let manifest = ImageManifest::from_reader(res.into_reader())?;
        Ok(manifest)
    }

    /// Get manifest, index or manifest list as stored in the registry, with its media type
    pub fn get_manifest_bytes(
        &mut self,
        ctx: &Context,
        reference: &Reference,
    ) -> Result<(String, Vec<u8>)> {
        let url = self
            .url
            .join(&format!("/v2/{}/manifests/{}", self.name, reference))?;
        let req = self.get(&url).set(
            "Accept",
            &format!(
                "{}, {}, {}, {}",
                MediaType::ImageManifest,
                MediaType::ImageIndex,
                "application/vnd.docker.distribution.manifest.v2+json",
                "application/vnd.docker.distribution.manifest.list.v2+json",
            ),
        );
        let res = self.send(ctx, req, None)?;
        let media_type = res.content_type().to_string();
        let mut buf = Vec::new();
        res.into_reader().read_to_end(&mut buf)?;
        Ok((media_type, buf))
    }

    /// Get digest of the manifest pointed by `reference` without downloading it.
    ///
    /// ```text
    /// HEAD /v2/<name>/manifests/<reference>
    /// ```
    pub fn get_manifest_digest(&mut self, ctx: &Context, reference: &Reference) -> Result<Digest> {
        if let Reference::Digest(digest) = reference {
            return Ok(digest.clone());
        }
        let url = self
            .url
            .join(&format!("/v2/{}/manifests/{}", self.name, reference))?;
        let req = self
            .head(&url)
            .set("Accept", &MediaType::ImageManifest.to_string());
        let res = self.send(ctx, req, None)?;
        let digest = res
            .header("Docker-Content-Digest")
            .ok_or_else(|| Error::NotFound(format!("digest of {}", url)))?;
        Digest::new(digest)
    }

    /// Push manifest to registry
    ///
    /// ```text
    /// PUT /v2/<name>/manifests/<reference>
    /// ```
    ///
    /// Manifest must be pushed after blobs are updated.
    ///
    /// See [corresponding OCI distribution spec document](https://github.com/opencontainers/distribution-spec/blob/main/spec.md#pushing-manifests) for detail.
    pub fn push_manifest(
        &mut self,
        ctx: &Context,
        reference: &Reference,
        manifest: &ImageManifest,
    ) -> Result<Url> {
        let mut buf = Vec::new();
        manifest.to_writer(&mut buf)?;
        self.push_manifest_bytes(ctx, reference, &MediaType::ImageManifest.to_string(), &buf)
    }

    /// Push already serialized manifest, index or manifest list as is
    /// so that its digest does not change.
    pub fn push_manifest_bytes(
        &mut self,
        ctx: &Context,
        reference: &Reference,
        media_type: &str,
        buf: &[u8],
    ) -> Result<Url> {
        let url = self
            .url
            .join(&format!("/v2/{}/manifests/{}", self.name, reference))?;
        let req = self.put(&url).set("Content-Type", media_type);
        let res = self.send(ctx, req, Some(buf))?;
        self.location(&res)
    }

    /// Delete manifest from registry
    ///
    /// ```text
    /// DELETE /v2/<name>/manifests/<digest>
    /// ```
    pub fn delete_manifest(&mut self, ctx: &Context, reference: &Reference) -> Result<()> {
        let digest = self.get_manifest_digest(ctx, reference)?;
        let url = self
            .url
            .join(&format!("/v2/{}/manifests/{}", self.name, digest))?;
        let req = self.delete(&url);
        self.send(ctx, req, None)?;
        Ok(())
    }

    /// Get blob for given digest
    ///
    /// ```text
    /// GET /v2/<name>/blobs/<digest>
    /// ```
    ///
    /// See [corresponding OCI distribution spec document](https://github.com/opencontainers/distribution-spec/blob/main/spec.md#pulling-blobs) for detail.
    pub fn get_blob(&mut self, ctx: &Context, digest: &Digest) -> Result<Vec<u8>> {
        let url = self
            .url
            .join(&format!("/v2/{}/blobs/{}", self.name.as_str(), digest,))?;
        let req = self.get(&url);
        let res = self.send(ctx, req, None)?;
        let mut bytes = Vec::new();
        res.into_reader().read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Check if the blob already exists in the repository
    ///
    /// ```text
    /// HEAD /v2/<name>/blobs/<digest>
    /// ```
    pub fn has_blob(&mut self, ctx: &Context, digest: &Digest) -> Result<bool> {
        let url = self
            .url
            .join(&format!("/v2/{}/blobs/{}", self.name.as_str(), digest,))?;
        let req = self.head(&url);
        match self.send(ctx, req, None) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Push blob to registry
    ///
    /// ```text
    /// POST /v2/<name>/blobs/uploads/
    /// ```
    ///
    /// and following `PUT` to URL obtained by `POST`.
    ///
    /// See [corresponding OCI distribution spec document](https://github.com/opencontainers/distribution-spec/blob/main/spec.md#pushing-manifests) for detail.
    pub fn push_blob(&mut self, ctx: &Context, blob: &[u8]) -> Result<(Digest, Url)> {
        let url = self
            .url
            .join(&format!("/v2/{}/blobs/uploads/", self.name))?;
        let req = self.post(&url);
        let res = self.send(ctx, req, None)?;
        let url = self.location(&res)?;

        let digest = Digest::from_buf_sha256(blob);
        let req = self
            .put(&url)
            .query("digest", &digest.to_string())
            .set("Content-Length", &blob.len().to_string())
            .set("Content-Type", "application/octet-stream");
        let res = self.send(ctx, req, Some(blob))?;
        let url = self.location(&res)?;
        Ok((digest, url))
    }
}

/// Send with the cached `Authorization` header, or anonymously without one.
///
/// A `401` is answered with a new header and the request is retried once.
/// Bearer tokens are scoped, so a token for pulling may be challenged again when pushing.
fn send_authorized<D, A>(
    authorization: &mut Option<String>,
    mut dispatch: D,
    mut authorize: A,
) -> Result<ureq::Response>
where
    D: FnMut(Option<&str>) -> std::result::Result<ureq::Response, ureq::Error>,
    A: FnMut(&Challenge) -> Result<String>,
{
    let challenge = match dispatch(authorization.as_deref()) {
        Ok(res) => return Ok(res),
        Err(e @ ureq::Error::Status(401, _)) => Challenge::try_from(e)?,
        Err(e) => return Err(e.into()),
    };
    *authorization = Some(authorize(&challenge)?);
    match dispatch(authorization.as_deref()) {
        Ok(res) => Ok(res),
        Err(ureq::Error::Status(401, res)) => {
            *authorization = None;
            Err(Error::AuthorizationFailed(Url::parse(res.get_url())?))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn ok() -> ureq::Response {
        "HTTP/1.1 200 OK\r\n\r\n".parse().unwrap()
    }

    fn unauthorized(scope: &str) -> ureq::Error {
        let res = format!(
            "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Bearer realm=\"https://auth.example.com/token\",service=\"example.com\",scope=\"{}\"\r\n\r\n",
            scope
        )
        .parse()
        .unwrap();
        ureq::Error::Status(401, res)
    }

    /// Registry accepting only a token issued for `scope`
    fn registry(
        scope: &str,
    ) -> impl FnMut(Option<&str>) -> std::result::Result<ureq::Response, ureq::Error> + '_ {
        move |authorization| {
            if authorization == Some(format!("Bearer {}", scope).as_str()) {
                Ok(ok())
            } else {
                Err(unauthorized(scope))
            }
        }
    }

    #[test]
    fn anonymous_access() -> Result<()> {
        let mut authorization = None;
        send_authorized(
            &mut authorization,
            |header| {
                assert!(header.is_none());
                Ok(ok())
            },
            |_| panic!("no challenge expected"),
        )?;
        assert!(authorization.is_none());
        Ok(())
    }

    #[test]
    fn token_challenged_again_for_push() -> Result<()> {
        let issued = Cell::new(0);
        let mut authorize = |challenge: &Challenge| -> Result<String> {
            match challenge {
                Challenge::Bearer {
                    scope: Some(scope), ..
                } => {
                    issued.set(issued.get() + 1);
                    Ok(format!("Bearer {}", scope))
                }
                _ => panic!("unexpected challenge: {:?}", challenge),
            }
        };
        let mut authorization = None;

        send_authorized(&mut authorization, registry("repository:ubi:pull"), &mut authorize)?;
        assert_eq!(authorization.as_deref(), Some("Bearer repository:ubi:pull"));
        assert_eq!(issued.get(), 1);

        // Cached token is reused
        send_authorized(&mut authorization, registry("repository:ubi:pull"), &mut authorize)?;
        assert_eq!(issued.get(), 1);

        send_authorized(
            &mut authorization,
            registry("repository:ubi:pull,push"),
            &mut authorize,
        )?;
        assert_eq!(
            authorization.as_deref(),
            Some("Bearer repository:ubi:pull,push")
        );
        assert_eq!(issued.get(), 2);
        Ok(())
    }

    #[test]
    fn rejected_token_is_not_retried_forever() {
        let sent = Cell::new(0);
        let mut authorization = Some("Bearer stale".to_string());
        let result = send_authorized(
            &mut authorization,
            |_| {
                sent.set(sent.get() + 1);
                Err(unauthorized("repository:ubi:pull"))
            },
            |_| Ok("Bearer wrong".to_string()),
        );
        assert!(matches!(result, Err(Error::AuthorizationFailed(_))));
        assert_eq!(sent.get(), 2);
        assert!(authorization.is_none());
    }

    #[test]
    fn not_found_is_not_challenged() {
        let mut authorization = None;
        let result = send_authorized(
            &mut authorization,
            |_| Err(ureq::Error::Status(404, "HTTP/1.1 404 Not Found\r\n\r\n".parse().unwrap())),
            |_| panic!("no challenge expected"),
        );
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    //
    // Following tests need registry server running at localhost:5000.
    // These tests are ignored by default.
    //

    fn test_url() -> Url {
        Url::parse("http://localhost:5000").unwrap()
    }
    fn test_name() -> Name {
        Name::new("test_repo").unwrap()
    }

    #[test]
    #[ignore]
    fn push_and_get_blob() -> Result<()> {
        let ctx = Context::new();
        let mut client = Client::new(test_url(), test_name())?;
        let (digest, _url) = client.push_blob(&ctx, "test string".as_bytes())?;
        assert!(client.has_blob(&ctx, &digest)?);
        let blob = client.get_blob(&ctx, &digest)?;
        assert_eq!(blob, "test string".as_bytes());
        Ok(())
    }

    #[test]
    fn tls_modes() -> Result<()> {
        assert_eq!(Tls::new(false, false), Tls::Verify);
        assert_eq!(Tls::new(false, true), Tls::SkipVerify);
        assert_eq!(Tls::new(true, false), Tls::Disabled);
        assert_eq!(Tls::new(true, true), Tls::Disabled);

        let image = ImageReference::parse("registry.example.com:5000/mirror/ubi8/ubi:latest")?;
        let client = Client::from_image_reference(&image, Tls::SkipVerify)?;
        assert_eq!(client.url.scheme(), "https");
        let client = Client::from_image_reference(&image, Tls::Disabled)?;
        assert_eq!(client.url.scheme(), "http");
        let client = Client::from_image_reference(&image, Tls::Verify)?;
        assert_eq!(client.url.scheme(), "https");
        Ok(())
    }

    #[test]
    fn cancelled_before_request() -> Result<()> {
        let ctx = Context::new();
        ctx.cancel();
        let mut client = Client::new(test_url(), test_name())?;
        let digest = Digest::from_buf_sha256(b"");
        assert!(matches!(
            client.get_blob(&ctx, &digest),
            Err(Error::Cancelled)
        ));
        Ok(())
    }
}
