//! Resolve which platform releases an image set has to contain

use crate::{
    cincinnati::{find_last_release, Update, UpdateGraph},
    config::ReleaseChannel,
    error::*,
    metadata::Metadata,
    Context, Logger,
};
use semver::Version;
use std::collections::BTreeMap;

/// A release to download for an architecture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub update: Update,
    pub arch: String,
}

/// Releases to download, keyed by release image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Downloads(BTreeMap<String, Download>);

impl Downloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, download: Download) {
        self.0.insert(download.update.image.clone(), download);
    }

    pub fn remove(&mut self, image: &str) -> Option<Download> {
        self.0.remove(image)
    }

    pub fn merge(&mut self, other: Downloads) {
        self.0.extend(other.0);
    }

    pub fn contains(&self, image: &str) -> bool {
        self.0.contains_key(image)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Download> {
        self.0.values()
    }

    pub fn versions(&self) -> Vec<Version> {
        let mut versions: Vec<Version> = self.iter().map(|d| d.update.version.clone()).collect();
        versions.sort();
        versions.dedup();
        versions
    }
}

impl IntoIterator for Downloads {
    type Item = Download;
    type IntoIter = std::collections::btree_map::IntoValues<String, Download>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_values()
    }
}

/// Releases needed to bring the mirror from the last recorded release to `version` in `channel`
#[allow(clippy::too_many_arguments)]
pub fn get_downloads(
    ctx: &Context,
    logger: &Logger,
    graph: &mut dyn UpdateGraph,
    meta: &Metadata,
    version: &str,
    channel: &str,
    arch: &str,
) -> Result<Downloads> {
    let requested = Version::parse(version)?;
    logger.info(format!("Downloading requested release {}", requested));

    let (source_channel, target_channel, start, target, reverse) =
        match find_last_release(meta) {
            Err(Error::NoPreviousRelease) => (
                channel.to_string(),
                channel.to_string(),
                requested.clone(),
                requested,
                false,
            ),
            Err(e) => return Err(e),
            Ok((last_channel, last_version)) if requested < last_version => {
                logger.debug(format!("Found current release {}", last_version));
                // Walk up from the requested release to the one downloaded before
                (channel.to_string(), last_channel, requested, last_version, true)
            }
            Ok((last_channel, last_version)) => {
                logger.debug(format!("Found current release {}", last_version));
                (last_channel, channel.to_string(), last_version, requested, false)
            }
        };

    let upgrades = graph.calculate_upgrades(
        ctx,
        arch,
        &source_channel,
        &target_channel,
        &start,
        &target,
    )?;

    let mut downloads = Downloads::new();
    for update in upgrades.updates {
        downloads.insert(Download {
            update,
            arch: arch.to_string(),
        });
    }
    if reverse {
        downloads.insert(Download {
            update: upgrades.current,
            arch: arch.to_string(),
        });
        // Already downloaded in a past run
        downloads.remove(&upgrades.newest.image);
    } else {
        downloads.insert(Download {
            update: upgrades.newest,
            arch: arch.to_string(),
        });
    }
    Ok(downloads)
}

/// Resolve downloads of every channel and architecture.
///
/// A failure of one channel and architecture does not stop the others,
/// and is returned in the error list. Channels without versions are resolved to
/// their `max_version`, or their latest release if it is not set, which is recorded into `channels`.
pub fn resolve_releases(
    ctx: &Context,
    logger: &Logger,
    graph: &mut dyn UpdateGraph,
    meta: &Metadata,
    channels: &mut [ReleaseChannel],
    archs: &[String],
) -> (Downloads, Vec<Error>) {
    let mut downloads = Downloads::new();
    let mut errs = Vec::new();
    let mut channel_versions = BTreeMap::new();

    for channel in channels.iter() {
        for arch in archs {
            let versions = if !channel.versions.is_empty() {
                channel.versions.clone()
            } else if !channel.max_version.is_empty() {
                channel_versions.insert(channel.name.clone(), channel.max_version.clone());
                vec![channel.max_version.clone()]
            } else {
                match graph.get_channel_latest(ctx, arch, &channel.name) {
                    Ok(latest) => {
                        channel_versions.insert(channel.name.clone(), latest.to_string());
                        vec![latest.to_string()]
                    }
                    Err(e) => {
                        logger.error(format!(
                            "channel {} ({}): {}",
                            channel.name, arch, e
                        ));
                        errs.push(e);
                        continue;
                    }
                }
            };

            for version in &versions {
                match get_downloads(ctx, logger, graph, meta, version, &channel.name, arch) {
                    Ok(new) => downloads.merge(new),
                    Err(e) => {
                        logger.error(format!(
                            "channel {} ({}): {}",
                            channel.name, arch, e
                        ));
                        errs.push(e);
                        break;
                    }
                }
            }
        }
    }

    update_release_channel(channels, &channel_versions);
    (downloads, errs)
}

/// Append resolved versions to the channels they were resolved for
pub fn update_release_channel(
    channels: &mut [ReleaseChannel],
    channel_versions: &BTreeMap<String, String>,
) {
    for channel in channels.iter_mut() {
        if let Some(version) = channel_versions.get(&channel.name) {
            channel.versions.push(version.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cincinnati::{Graph, GraphNode, Upgrades};

    /// One in-memory graph serving every channel
    struct FakeGraph {
        graph: Graph,
        queries: Vec<(String, String)>,
        latest_queries: Vec<String>,
    }

    impl FakeGraph {
        fn new(versions: &[&str]) -> Self {
            let nodes = versions
                .iter()
                .map(|v| GraphNode {
                    version: Version::parse(v).unwrap(),
                    payload: image(v),
                })
                .collect::<Vec<_>>();
            let edges = (1..nodes.len()).map(|i| (i - 1, i)).collect();
            FakeGraph {
                graph: Graph { nodes, edges },
                queries: Vec::new(),
                latest_queries: Vec::new(),
            }
        }
    }

    impl UpdateGraph for FakeGraph {
        fn calculate_upgrades(
            &mut self,
            _ctx: &Context,
            _arch: &str,
            source_channel: &str,
            target_channel: &str,
            start: &Version,
            target: &Version,
        ) -> Result<Upgrades> {
            self.queries
                .push((source_channel.to_string(), target_channel.to_string()));
            self.graph
                .upgrades(start, target)
                .map_err(|reason| Error::GraphQuery {
                    url: url::Url::parse("https://graph.invalid").unwrap(),
                    reason,
                })
        }

        fn get_channel_latest(&mut self, _: &Context, arch: &str, _: &str) -> Result<Version> {
            self.latest_queries.push(arch.to_string());
            Ok(self.graph.latest().unwrap().version)
        }
    }

    fn image(version: &str) -> String {
        format!("quay.io/openshift-release-dev/ocp-release:{}-x86_64", version)
    }

    fn meta_with(channel: &str, versions: &[&str]) -> Metadata {
        let mut meta = Metadata::new();
        meta.past_mirror.mirror.platform.channels = vec![ReleaseChannel {
            name: channel.to_string(),
            versions: versions.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }];
        meta
    }

    fn graph() -> FakeGraph {
        FakeGraph::new(&["4.9.0", "4.9.1", "4.9.3", "4.9.5"])
    }

    #[test]
    fn first_run() -> Result<()> {
        let ctx = Context::new();
        let mut g = graph();
        let downloads = get_downloads(
            &ctx,
            &Logger::default(),
            &mut g,
            &Metadata::new(),
            "4.9.3",
            "stable-4.9",
            "amd64",
        )?;
        assert_eq!(downloads.len(), 1);
        assert!(downloads.contains(&image("4.9.3")));
        Ok(())
    }

    #[test]
    fn forward() -> Result<()> {
        let ctx = Context::new();
        let mut g = graph();
        let meta = meta_with("stable-4.9", &["4.9.0"]);
        let downloads = get_downloads(
            &ctx,
            &Logger::default(),
            &mut g,
            &meta,
            "4.9.5",
            "fast-4.9",
            "amd64",
        )?;
        assert_eq!(
            downloads.versions(),
            vec![
                Version::parse("4.9.1")?,
                Version::parse("4.9.3")?,
                Version::parse("4.9.5")?
            ]
        );
        assert!(!downloads.contains(&image("4.9.0")));
        // From recorded channel to requested channel
        assert_eq!(
            g.queries,
            vec![("stable-4.9".to_string(), "fast-4.9".to_string())]
        );
        Ok(())
    }

    #[test]
    fn downgrade() -> Result<()> {
        let ctx = Context::new();
        let mut g = graph();
        let meta = meta_with("stable-4.9", &["4.9.5"]);
        let downloads = get_downloads(
            &ctx,
            &Logger::default(),
            &mut g,
            &meta,
            "4.9.0",
            "fast-4.9",
            "amd64",
        )?;
        assert!(downloads.contains(&image("4.9.0")));
        assert!(!downloads.contains(&image("4.9.5")));
        assert_eq!(
            g.queries,
            vec![("fast-4.9".to_string(), "stable-4.9".to_string())]
        );
        Ok(())
    }

    #[test]
    fn resolve_all_channels() -> Result<()> {
        let ctx = Context::new();
        let mut g = graph();
        let mut channels = vec![
            ReleaseChannel {
                name: "stable-4.9".to_string(),
                ..Default::default()
            },
            ReleaseChannel {
                name: "broken".to_string(),
                versions: vec!["4.8.0".to_string()],
                ..Default::default()
            },
        ];
        let archs = vec!["amd64".to_string()];
        let (downloads, errs) = resolve_releases(
            &ctx,
            &Logger::default(),
            &mut g,
            &Metadata::new(),
            &mut channels,
            &archs,
        );
        assert_eq!(downloads.versions(), vec![Version::parse("4.9.5")?]);
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0], Error::GraphQuery { .. }));
        assert_eq!(channels[0].versions, vec!["4.9.5".to_string()]);
        assert!(channels[1].versions == vec!["4.8.0".to_string()]);
        Ok(())
    }

    #[test]
    fn latest_recorded_once_for_all_archs() -> Result<()> {
        let ctx = Context::new();
        let mut g = graph();
        let mut channels = vec![ReleaseChannel {
            name: "stable-4.9".to_string(),
            ..Default::default()
        }];
        let archs = vec!["amd64".to_string(), "arm64".to_string()];
        let (downloads, errs) = resolve_releases(
            &ctx,
            &Logger::default(),
            &mut g,
            &Metadata::new(),
            &mut channels,
            &archs,
        );
        assert!(errs.is_empty());
        assert_eq!(g.latest_queries, archs);
        assert_eq!(downloads.versions(), vec![Version::parse("4.9.5")?]);
        assert_eq!(channels[0].versions, vec!["4.9.5".to_string()]);
        Ok(())
    }

    #[test]
    fn max_version_as_target() -> Result<()> {
        let ctx = Context::new();
        let mut g = graph();
        let mut channels = vec![ReleaseChannel {
            name: "stable-4.9".to_string(),
            max_version: "4.9.3".to_string(),
            ..Default::default()
        }];
        let archs = vec!["amd64".to_string()];
        let (downloads, errs) = resolve_releases(
            &ctx,
            &Logger::default(),
            &mut g,
            &Metadata::new(),
            &mut channels,
            &archs,
        );
        assert!(errs.is_empty());
        assert!(g.latest_queries.is_empty());
        assert_eq!(downloads.versions(), vec![Version::parse("4.9.3")?]);
        assert_eq!(channels[0].versions, vec!["4.9.3".to_string()]);

        // Explicit versions take precedence
        let mut channels = vec![ReleaseChannel {
            name: "stable-4.9".to_string(),
            versions: vec!["4.9.1".to_string()],
            max_version: "4.9.3".to_string(),
            ..Default::default()
        }];
        let (downloads, _) = resolve_releases(
            &ctx,
            &Logger::default(),
            &mut g,
            &Metadata::new(),
            &mut channels,
            &archs,
        );
        assert_eq!(downloads.versions(), vec![Version::parse("4.9.1")?]);
        assert_eq!(channels[0].versions, vec!["4.9.1".to_string()]);
        Ok(())
    }
}
