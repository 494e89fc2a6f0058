//! Upstream update graph of platform releases
//!
//! The graph service returns, for a channel and architecture, every release in the channel
//! as nodes and the supported upgrades between them as edges:
//!
//! ```json
//! {
//!   "nodes": [{ "version": "4.9.0", "payload": "quay.io/openshift-release-dev/ocp-release@sha256:..." }],
//!   "edges": [[0, 1]]
//! }
//! ```

mod graph;

pub use graph::{Graph, Node as GraphNode};

use crate::{
    config::{OKD_CHANNEL, OKD_UPDATE_URL, UPDATE_URL},
    error::*,
    metadata::Metadata,
    Context,
};
use semver::Version;
use url::Url;
use uuid::Uuid;

/// A release in the update graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Update {
    pub version: Version,
    /// Release image realizing this version
    pub image: String,
}

/// Result of [UpdateGraph::calculate_upgrades]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upgrades {
    /// Release the walk starts from
    pub current: Update,
    /// Release the walk ends at
    pub newest: Update,
    /// Releases strictly between `current` and `newest`, in walk order
    pub updates: Vec<Update>,
}

/// Query for upgrade walks between releases
pub trait UpdateGraph {
    /// Shortest upgrade walk from `start` in `source_channel` to `target` in `target_channel`
    fn calculate_upgrades(
        &mut self,
        ctx: &Context,
        arch: &str,
        source_channel: &str,
        target_channel: &str,
        start: &Version,
        target: &Version,
    ) -> Result<Upgrades>;

    /// Latest release in the channel
    fn get_channel_latest(&mut self, ctx: &Context, arch: &str, channel: &str) -> Result<Version>;
}

/// [UpdateGraph] backed by the graph service over HTTPS
pub struct CincinnatiClient {
    agent: ureq::Agent,
    url: Url,
    okd_url: Url,
    id: Uuid,
}

impl CincinnatiClient {
    /// `url` serves every channel except `okd`, which is served by `okd_url`
    pub fn new(url: Url, okd_url: Url, id: Uuid) -> Self {
        CincinnatiClient {
            agent: ureq::Agent::new(),
            url,
            okd_url,
            id,
        }
    }

    /// Client for the default upstream
    pub fn upstream(id: Uuid) -> Result<Self> {
        Ok(Self::new(
            Url::parse(UPDATE_URL)?,
            Url::parse(OKD_UPDATE_URL)?,
            id,
        ))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Endpoint serving the graph of `channel`
    pub fn channel_url(&self, channel: &str) -> &Url {
        if channel == OKD_CHANNEL {
            &self.okd_url
        } else {
            &self.url
        }
    }

    /// Query of a graph request. The OKD graph takes none.
    fn query(
        &self,
        arch: &str,
        channel: &str,
        version: Option<&Version>,
    ) -> Vec<(&'static str, String)> {
        if channel == OKD_CHANNEL {
            return Vec::new();
        }
        let mut query = vec![("id", self.id.to_string())];
        for (key, value) in [("arch", arch), ("channel", channel)] {
            if !value.is_empty() {
                query.push((key, value.to_string()));
            }
        }
        if let Some(version) = version {
            query.push(("version", version.to_string()));
        }
        query
    }

    /// Get the graph of the channel
    ///
    /// ```text
    /// GET <url>?id=<id>&arch=<arch>&channel=<channel>[&version=<version>]
    /// ```
    pub fn get_graph(
        &self,
        ctx: &Context,
        arch: &str,
        channel: &str,
        version: Option<&Version>,
    ) -> Result<Graph> {
        ctx.check()?;
        let url = self.channel_url(channel);
        let err = |reason: String| Error::GraphQuery {
            url: url.clone(),
            reason,
        };
        let mut req = self
            .agent
            .get(url.as_str())
            .set("Accept", "application/json");
        for (key, value) in self.query(arch, channel, version) {
            req = req.query(key, &value);
        }
        if let Some(timeout) = ctx.remaining() {
            req = req.timeout(timeout);
        }
        log::info!("GET {} (channel={}, arch={})", url, channel, arch);
        let res = req.call().map_err(|e| err(e.to_string()))?;
        let graph: Graph = res.into_json().map_err(|e| err(e.to_string()))?;
        Ok(graph)
    }
}

impl UpdateGraph for CincinnatiClient {
    fn calculate_upgrades(
        &mut self,
        ctx: &Context,
        arch: &str,
        source_channel: &str,
        target_channel: &str,
        start: &Version,
        target: &Version,
    ) -> Result<Upgrades> {
        let mut graph = self.get_graph(ctx, arch, source_channel, None)?;
        if source_channel != target_channel {
            let other = self.get_graph(ctx, arch, target_channel, None)?;
            graph = graph.union(other);
        }
        graph.upgrades(start, target).map_err(|reason| Error::GraphQuery {
            url: self.channel_url(target_channel).clone(),
            reason,
        })
    }

    fn get_channel_latest(&mut self, ctx: &Context, arch: &str, channel: &str) -> Result<Version> {
        let graph = self.get_graph(ctx, arch, channel, None)?;
        graph
            .latest()
            .map(|update| update.version)
            .ok_or_else(|| Error::GraphQuery {
                url: self.channel_url(channel).clone(),
                reason: format!("no release found in channel {}", channel),
            })
    }
}

/// Channel and version of the newest release recorded in the past mirror
pub fn find_last_release(meta: &Metadata) -> Result<(String, Version)> {
    let mut last: Option<(String, Version)> = None;
    for channel in &meta.past_mirror.mirror.platform.channels {
        for version in &channel.versions {
            let version = Version::parse(version)?;
            match &last {
                Some((_, current)) if current >= &version => {}
                _ => last = Some((channel.name.clone(), version)),
            }
        }
    }
    last.ok_or(Error::NoPreviousRelease)
}
