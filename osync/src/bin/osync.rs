use anyhow::{Context, anyhow};
use clap::{CommandFactory, FromArgMatches, Parser};
use common::filter::{FilterSettings, RuleKind};
use std::sync::Arc;

use osync::cluster::{self, Endpoints};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "osync",
    version,
    about = "Synchronize objects between two storages, like `rsync` but optionally spread over many hosts",
    long_about = "`osync` compares two sorted listings and copies, updates or deletes keys until the destination matches the source.

Keys present on both sides are copied only when their size differs, unless --update, --force-update or --check-all choose otherwise. Use --worker to spread the transfers over other hosts: the executable is copied there over SSH and started as a worker fetching tasks from this process.

EXAMPLES:
    # Mirror a directory and remove what is gone from the source
    osync /data/src/ /backup/src/ --delete-dst --summary

    # Copy only newer files, keep permissions and symlinks
    osync /data/src/ /backup/src/ --update --perms --links

    # Sync only rust sources, skip the build output
    osync /repo/ /mirror/ --exclude target/ --include '*.rs' --include '*/' --exclude '*'

    # Spread the transfers over two more hosts
    osync /nfs/a/ /nfs/b/ --worker alice@node1,node2:2222 --progress"
)]
struct Args {
    // Selection
    /// First key to sync (inclusive)
    #[arg(short = 's', long, value_name = "KEY", help_heading = "Selection")]
    start: Option<String>,

    /// Last key to sync (inclusive)
    #[arg(short = 'e', long, value_name = "KEY", help_heading = "Selection")]
    end: Option<String>,

    /// Include keys matching the pattern; rules are checked in command line order
    #[arg(long, value_name = "PATTERN", help_heading = "Selection")]
    include: Vec<String>,

    /// Exclude keys matching the pattern; rules are checked in command line order
    #[arg(long, value_name = "PATTERN", help_heading = "Selection")]
    exclude: Vec<String>,

    /// Read include/exclude rules from a file, checked after the command line rules
    ///
    /// One `--include PATTERN` or `--exclude PATTERN` per line, `#` starts a comment.
    #[arg(long, value_name = "PATH", help_heading = "Selection")]
    filter_file: Option<std::path::PathBuf>,

    /// Act on at most N keys (-1 = no limit)
    #[arg(
        long,
        default_value = "-1",
        value_name = "N",
        allow_negative_numbers = true,
        help_heading = "Selection"
    )]
    limit: i64,

    /// Sync directories too (as placeholder keys ending with `/`)
    #[arg(long, help_heading = "Selection")]
    dirs: bool,

    // Sync policy
    /// Copy keys present on both sides only when the source is newer
    #[arg(short = 'u', long, help_heading = "Sync policy")]
    update: bool,

    /// Always overwrite keys present on both sides
    #[arg(short = 'f', long, help_heading = "Sync policy")]
    force_update: bool,

    /// Skip keys missing at the destination
    #[arg(long, help_heading = "Sync policy")]
    existing: bool,

    /// Skip keys already present at the destination
    #[arg(long, help_heading = "Sync policy")]
    ignore_existing: bool,

    /// Delete keys from the source once they are in sync
    #[arg(long, help_heading = "Sync policy")]
    delete_src: bool,

    /// Delete destination keys missing at the source
    #[arg(long, help_heading = "Sync policy")]
    delete_dst: bool,

    /// Compare checksums of keys present on both sides and verify every copy
    #[arg(long, help_heading = "Sync policy")]
    check_all: bool,

    /// Verify checksums of newly copied keys
    #[arg(long, help_heading = "Sync policy")]
    check_new: bool,

    /// Only show what would be done
    #[arg(long, help_heading = "Sync policy")]
    dry: bool,

    /// Preserve permissions, ownership and modification time
    #[arg(long, help_heading = "Sync policy")]
    perms: bool,

    /// Copy symbolic links as links instead of following them
    #[arg(short = 'l', long, help_heading = "Sync policy")]
    links: bool,

    /// Storage class of written objects
    #[arg(long, value_name = "CLASS", help_heading = "Sync policy")]
    storage_class: Option<String>,

    // Performance & throttling
    /// Number of concurrent transfers
    #[arg(
        short = 'p',
        long,
        default_value = "10",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    threads: usize,

    /// Number of concurrent listing requests
    #[arg(
        long,
        default_value = "1",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    list_threads: usize,

    /// Depth down to which directories are listed concurrently
    #[arg(
        long,
        default_value = "1",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    list_depth: usize,

    /// Bandwidth limit in Mbps (0 = no limit)
    #[arg(
        long,
        default_value = "0",
        value_name = "MBPS",
        help_heading = "Performance & throttling"
    )]
    bwlimit: u64,

    /// Objects larger than this are uploaded in parts when the destination supports it
    ///
    /// Accepts byte sizes like "32MiB", "1GiB", or plain numbers in bytes.
    #[arg(
        long,
        default_value = "32MiB",
        value_name = "SIZE",
        help_heading = "Performance & throttling"
    )]
    part_size: bytesize::ByteSize,

    // Cluster
    /// Hosts to start workers on, `[user@]host[:port]`, comma separated; may repeat
    #[arg(long, value_name = "HOSTS", help_heading = "Cluster")]
    worker: Vec<String>,

    /// Run as a worker of the manager at ADDR
    #[arg(long, value_name = "ADDR", help_heading = "Cluster")]
    manager: Option<String>,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Set delay between progress updates
    ///
    /// Accepts human-readable durations like "500ms", "10s", "5min". If specified, --progress
    /// flag is implied.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<humantime::Duration>,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source and destination: local paths or file:// URIs
    #[arg()]
    paths: Vec<String>,
}

/// Include and exclude rules in the order they were given.
fn command_line_rules(matches: &clap::ArgMatches) -> Vec<(RuleKind, String)> {
    let mut rules = Vec::new();
    for (id, kind) in [("include", RuleKind::Include), ("exclude", RuleKind::Exclude)] {
        if let (Some(values), Some(indices)) =
            (matches.get_many::<String>(id), matches.indices_of(id))
        {
            rules.extend(
                values
                    .zip(indices)
                    .map(|(value, index)| (index, kind, value.clone())),
            );
        }
    }
    rules.sort_by_key(|(index, _, _)| *index);
    rules
        .into_iter()
        .map(|(_, kind, pattern)| (kind, pattern))
        .collect()
}

fn sync_config(
    args: &Args,
    rules: &[(RuleKind, String)],
) -> anyhow::Result<common::SyncConfig> {
    let mut filter = FilterSettings::new();
    for (kind, pattern) in rules {
        filter
            .add(*kind, pattern)
            .with_context(|| format!("invalid pattern {pattern:?}"))?;
    }
    if let Some(path) = &args.filter_file {
        filter.extend(FilterSettings::from_file(path)?);
    }
    let config = common::SyncConfig {
        threads: args.threads,
        list_threads: args.list_threads,
        list_depth: args.list_depth,
        start: args.start.clone(),
        end: args.end.clone(),
        limit: u64::try_from(args.limit).ok(),
        filter,
        update: args.update,
        force_update: args.force_update,
        existing: args.existing,
        ignore_existing: args.ignore_existing,
        delete_src: args.delete_src,
        delete_dst: args.delete_dst,
        check_all: args.check_all,
        check_new: args.check_new,
        dry: args.dry,
        dirs: args.dirs,
        perms: args.perms,
        links: args.links,
        storage_class: args.storage_class.clone(),
        bwlimit: args.bwlimit,
        part_size: args.part_size.as_u64(),
        manager: args.manager.clone(),
        workers: args.worker.clone(),
    };
    config.validate().map_err(|err| anyhow!(err))?;
    Ok(config)
}

async fn async_main(
    args: Args,
    rules: Vec<(RuleKind, String)>,
    stats: Arc<common::Stats>,
) -> anyhow::Result<common::Summary> {
    let [src, dst] = args.paths.as_slice() else {
        return Err(anyhow!(
            "expected exactly two arguments, SRC and DST, got {}",
            args.paths.len()
        ));
    };
    let config = sync_config(&args, &rules)?;
    let (src, dst) = osync::uri::open(src, dst, !config.links)?;
    let endpoints = Endpoints { src, dst };
    if let Some(manager) = &config.manager {
        return cluster::run_worker(
            endpoints,
            &config,
            stats,
            manager,
            remote::protocol::RetryPolicy::default(),
        )
        .await;
    }
    if !config.workers.is_empty() {
        let hosts = remote::SshSession::parse_list(&config.workers)?;
        let launcher = Arc::new(remote::launcher::SshLauncher::new(std::env::args().collect()));
        return cluster::run_manager(
            endpoints,
            &config,
            stats,
            launcher,
            hosts,
            std::net::SocketAddr::from(([0, 0, 0, 0], 0)),
        )
        .await;
    }
    cluster::run_local(endpoints, &config, stats).await
}

fn main() -> Result<(), anyhow::Error> {
    let matches = Args::command().get_matches();
    let args = Args::from_arg_matches(&matches)?;
    let rules = command_line_rules(&matches);
    let stats = Arc::new(common::Stats::new());
    let func = {
        let args = args.clone();
        let stats = stats.clone();
        || async_main(args, rules, stats)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let progress = if args.progress || args.progress_delay.is_some() {
        Some(common::ProgressSettings {
            delay: args
                .progress_delay
                .map(Into::into)
                .unwrap_or_else(|| common::ProgressSettings::default().delay),
        })
    } else {
        None
    };
    let res = common::run(progress, output, runtime, stats, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
