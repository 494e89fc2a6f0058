use anyhow::{bail, Context as _, Result};
use clap::{Parser, ValueEnum};
use ocmirror::{
    cincinnati::CincinnatiClient,
    config::{self, LOG_FILE, OKD_UPDATE_URL, UPDATE_URL},
    metadata::UidPolicy,
    mirror::{MirrorOptions, RegistryPusher, RegistryReleaseMirrorer},
    reconcile::RegistryBlobFetcher,
    Context, Logger,
};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, Parser)]
#[command(version)]
enum Opt {
    /// Mirror releases requested by an image set configuration into an archive
    Create {
        /// Image set configuration, TOML or JSON
        #[arg(short = 'c', long = "config")]
        config: PathBuf,

        /// Directory where archive parts are written
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,

        /// Maximum size of an archive part in bytes
        #[arg(long = "max-archive-size")]
        max_archive_size: Option<u64>,

        /// Architectures of releases
        #[arg(long = "arch", default_value = "amd64")]
        architectures: Vec<String>,

        /// Skip certificate verification of source registries
        #[arg(long = "source-skip-tls")]
        source_skip_tls: bool,

        #[command(flatten)]
        common: Common,
    },

    /// Publish an image set archive to a registry
    Publish {
        /// Image set archive, or a directory of archive parts
        #[arg(long = "from")]
        from: PathBuf,

        /// Destination registry, e.g. `localhost:5000`
        to_mirror: String,

        /// Namespace prepended to destination repositories
        #[arg(long = "user-namespace", default_value = "")]
        user_namespace: String,

        /// Skip certificate verification of the destination registry
        #[arg(long = "dest-skip-tls")]
        dest_skip_tls: bool,

        /// Access destination registry over plain HTTP
        #[arg(long = "dest-use-http")]
        dest_plain_http: bool,

        /// What to do with an image set of another lineage
        #[arg(long = "uid-policy", value_enum, default_value_t = Policy::NewLineage)]
        uid_policy: Policy,

        /// Directory where Helm charts are unpacked
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,

        #[command(flatten)]
        common: Common,
    },
}

#[derive(Debug, clap::Args)]
struct Common {
    /// Workspace directory
    #[arg(long = "dir")]
    dir: Option<PathBuf>,

    /// Print actions without mirroring images
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Keep temporary workspaces
    #[arg(long = "skip-cleanup")]
    skip_cleanup: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Policy {
    NewLineage,
    Reject,
}

impl From<Policy> for UidPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::NewLineage => UidPolicy::NewLineage,
            Policy::Reject => UidPolicy::Reject,
        }
    }
}

/// Write log records to stderr and a file in the workspace
struct Tee {
    file: fs::File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logger(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE);
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("cannot open log file {}", path.display()))?;
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .target(env_logger::Target::Pipe(Box::new(Tee { file })))
        .init();
    Ok(())
}

fn workspace(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => Ok(config::data_dir()?),
    }
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    let ctx = Context::new();
    let logger = Logger::default().with_newline_truncate(true);

    match opt {
        Opt::Create {
            config: config_path,
            output,
            max_archive_size,
            architectures,
            source_skip_tls,
            common,
        } => {
            let dir = workspace(common.dir)?;
            init_logger(&dir)?;
            let cfg = config::load_config(&config_path)?;
            let opts = MirrorOptions {
                dir,
                source_skip_tls,
                dry_run: common.dry_run,
                skip_cleanup: common.skip_cleanup,
                architectures,
                output_dir: output,
                max_archive_size,
                logger,
                ..Default::default()
            };
            let url = cfg.mirror.platform.graph_url.as_deref().unwrap_or(UPDATE_URL);
            let mut graph =
                CincinnatiClient::new(url.parse()?, OKD_UPDATE_URL.parse()?, uuid::Uuid::new_v4());
            let mut releases = RegistryReleaseMirrorer::new(opts.source_tls());
            let parts = opts.create(&ctx, &cfg, &mut graph, &mut releases)?;
            for part in parts {
                println!("{}", part.display());
            }
        }

        Opt::Publish {
            from,
            to_mirror,
            user_namespace,
            dest_skip_tls,
            dest_plain_http,
            uid_policy,
            output,
            common,
        } => {
            if !from.exists() {
                bail!("image set {} does not exist", from.display());
            }
            let dir = workspace(common.dir)?;
            init_logger(&dir)?;
            let opts = MirrorOptions {
                dir,
                from,
                to_mirror: to_mirror
                    .trim_start_matches("docker://")
                    .to_string(),
                user_namespace,
                dest_skip_tls,
                dest_plain_http,
                dry_run: common.dry_run,
                skip_cleanup: common.skip_cleanup,
                uid_policy: uid_policy.into(),
                output_dir: output,
                logger,
                ..Default::default()
            };
            let mut pusher = RegistryPusher::new();
            let mut fetcher = RegistryBlobFetcher::new();
            let mapping = opts.publish(&ctx, &mut pusher, &mut fetcher, None)?;
            for (src, dest) in mapping.iter() {
                println!("{}={}", src.reference.exact(), dest.reference.exact());
            }
        }
    }
    Ok(())
}
