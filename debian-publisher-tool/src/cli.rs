// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    chrono::{DateTime, Utc},
    clap::{Arg, ArgMatches, Command},
    debian_archive_publisher::{
        config::PublisherConfig,
        domination::Dominator,
        error::PublisherError,
        lock::RunLock,
        pool::{DiskPool, PoolAddOutcome},
        publication::MemoryPublicationStore,
    },
    log::{error, LevelFilter},
    std::path::Path,
    thiserror::Error,
};

const CONFIG_ABOUT: &str = "\
Publisher Configuration

All commands read a YAML configuration file given by --config. It has the
following keys:

pool.root (required) (string)
   Root directory of the pool. Files live at
   <component>/<prefix>/<source>/<filename> beneath it.

pool.temp_dir (required) (string)
   Directory holding files while they are written. Must be on the same
   filesystem as pool.root and must not be inside it.

pool.layout (optional) (string)
   Pool layout. Only `component-then-name-prefix` (alias `debian`) exists.

pool.checksum (optional) (string)
   Checksum flavor used to compare file content: md5, sha1 (default) or
   sha256.

pool.preferred_components (optional) (list[string])
   Components in order of preference for holding real files. Used by
   sanitise-links.

pool.lock_file (optional) (string)
   Lock file held by commands that modify the pool or publication records.
   Only one publisher may operate on a pool at a time.

domination.archive (optional) (string)
   Archive whose publications are dominated. Defaults to `primary`.

domination.stay_of_execution_hours (optional) (integer)
   Hours between a publication becoming removable and its scheduled
   deletion. Defaults to 24.

domination.suites (optional) (list[{distroseries, pocket}])
   Suites to dominate, in order. pocket is one of release, security,
   updates, proposed, backports.
";

#[derive(Debug, Error)]
pub enum DptError {
    #[error("argument parsing error: {0:?}")]
    Clap(#[from] clap::Error),

    #[error("{0}")]
    Publisher(#[from] PublisherError),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("{0} has no filename")]
    NoFilename(String),

    #[error("invalid sub-command: {0}")]
    InvalidSubCommand(String),
}

pub type Result<T> = std::result::Result<T, DptError>;

fn component_source_args(command: Command<'static>) -> Command<'static> {
    command
        .arg(
            Arg::new("component")
                .long("component")
                .takes_value(true)
                .required(true)
                .help("Archive component"),
        )
        .arg(
            Arg::new("source")
                .long("source")
                .takes_value(true)
                .required(true)
                .help("Source package name"),
        )
}

pub fn run_cli() -> Result<()> {
    let app = Command::new("Debian Publisher Tool")
        .version("0.1")
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Maintain a Debian archive pool and its publications")
        .arg_required_else_help(true);

    let app = app
        .arg(
            Arg::new("config")
                .long("config")
                .takes_value(true)
                .global(true)
                .help("Path to the YAML publisher configuration"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times"),
        );

    let app = app.subcommand(Command::new("scan-pool").about("Scan the pool and print statistics"));

    let app = app.subcommand(
        component_source_args(
            Command::new("pool-path").about("Print the pool path of a source package or file"),
        )
        .arg(Arg::new("filename").help("Filename within the source directory")),
    );

    let app = app.subcommand(
        component_source_args(
            Command::new("add-file").about("Add a local file to the pool"),
        )
        .arg(
            Arg::new("path")
                .required(true)
                .allow_invalid_utf8(true)
                .help("Path of the file to add"),
        ),
    );

    let app = app.subcommand(
        component_source_args(
            Command::new("remove-file").about("Remove a file from a component of the pool"),
        )
        .arg(
            Arg::new("filename")
                .required(true)
                .help("Filename to remove"),
        ),
    );

    let app = app.subcommand(
        Command::new("sanitise-links")
            .about("Move real files into the most preferred component publishing them"),
    );

    let app = app.subcommand(
        Command::new("dominate")
            .about("Dominate publications of the configured suites")
            .arg(
                Arg::new("records")
                    .long("records")
                    .takes_value(true)
                    .required(true)
                    .allow_invalid_utf8(true)
                    .help("YAML file of publication records; updated in place"),
            )
            .arg(
                Arg::new("now")
                    .long("now")
                    .takes_value(true)
                    .help("RFC 3339 timestamp to use as the current time"),
            ),
    );

    let mut app = app.subcommand(Command::new("config").about("Print documentation about the configuration file"));

    let matches = app.clone().get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    let result = match matches.subcommand() {
        Some(("config", _)) => {
            println!("{}", CONFIG_ABOUT);
            Ok(())
        }
        Some(("scan-pool", args)) => command_scan_pool(args),
        Some(("pool-path", args)) => command_pool_path(args),
        Some(("add-file", args)) => command_add_file(args),
        Some(("remove-file", args)) => command_remove_file(args),
        Some(("sanitise-links", args)) => command_sanitise_links(args),
        Some(("dominate", args)) => command_dominate(args),
        Some((command, _)) => Err(DptError::InvalidSubCommand(command.to_string())),
        None => {
            app.print_help()?;
            Ok(())
        }
    };

    if let Err(DptError::Publisher(e)) = &result {
        if e.is_corruption() {
            error!("archive content is corrupt; halting for manual investigation");
        }
    }

    result
}

fn load_config(args: &ArgMatches) -> Result<PublisherConfig> {
    let path = args.value_of("config").unwrap_or("publisher.yaml");

    Ok(PublisherConfig::from_yaml_path(path)?)
}

fn take_lock(config: &PublisherConfig) -> Result<Option<RunLock>> {
    Ok(match &config.pool.lock_file {
        Some(path) => Some(RunLock::acquire(path)?),
        None => None,
    })
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> &'a str {
    args.value_of(name)
        .expect("clap should have enforced required argument")
}

fn command_scan_pool(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    let pool = DiskPool::from_config(&config.pool)?;

    let stats = pool.stats();
    println!("entries: {}", stats.entries);
    println!("components: {}", stats.components);
    println!("files: {}", stats.files);
    println!("symlinks: {}", stats.symlinks);

    Ok(())
}

fn command_pool_path(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    let pool = DiskPool::new(&config.pool.root, &config.pool.temp_dir, config.pool.layout)?;

    let path = pool.path_for(
        required(args, "component"),
        required(args, "source"),
        args.value_of("filename"),
    )?;
    println!("{}", path.display());

    Ok(())
}

fn command_add_file(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    let _lock = take_lock(&config)?;

    let path = Path::new(
        args.value_of_os("path")
            .expect("path argument is required"),
    );
    let filename = path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| DptError::NoFilename(format!("{}", path.display())))?;

    let digest = config.pool.checksum.digest_path(path)?;

    let mut pool = DiskPool::from_config(&config.pool)?;
    let outcome = pool.add_file(
        required(args, "component"),
        required(args, "source"),
        filename,
        &digest,
        std::io::BufReader::new(std::fs::File::open(path)?),
    )?;

    match outcome {
        PoolAddOutcome::Added(size) => println!("added {} ({} bytes)", filename, size),
        PoolAddOutcome::Symlinked => println!("symlinked {}", filename),
        PoolAddOutcome::AlreadyPresent => println!("{} already present", filename),
    }

    Ok(())
}

fn command_remove_file(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    let _lock = take_lock(&config)?;

    let mut pool = DiskPool::from_config(&config.pool)?;
    let filename = required(args, "filename");
    let freed = pool.remove_file(
        required(args, "component"),
        required(args, "source"),
        filename,
    )?;

    println!("removed {}; freed {} bytes", filename, freed);

    Ok(())
}

fn command_sanitise_links(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    let _lock = take_lock(&config)?;

    let mut pool = DiskPool::from_config(&config.pool)?;
    pool.sanitise_links(&config.pool.preferred_components[..])?;

    Ok(())
}

fn command_dominate(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    let _lock = take_lock(&config)?;

    let records_path = Path::new(
        args.value_of_os("records")
            .expect("records argument is required"),
    );

    let now = match args.value_of("now") {
        Some(value) => DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc),
        None => Utc::now(),
    };

    let mut store = MemoryPublicationStore::from_yaml_path(records_path)?;

    let report = Dominator::from_config(&mut store, &config.domination)
        .judge_and_dominate_suites(&config.domination.suites, now, || true)?;

    // Write beside the records then rename so an interrupted write keeps the old records.
    let temp_path = records_path.with_extension("yaml.new");
    store.to_yaml_writer(std::fs::File::create(&temp_path)?)?;
    std::fs::rename(&temp_path, records_path)?;

    println!(
        "{} suites: superseded {} sources, {} binaries; scheduled deletion of {} sources, {} binaries; {} sources held",
        report.suites,
        report.superseded_sources,
        report.superseded_binaries,
        report.judged_sources,
        report.judged_binaries,
        report.blocked_sources
    );

    Ok(())
}
