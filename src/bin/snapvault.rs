use clap::Parser;
use clap::Subcommand;
use snapvault::chain_error;
use snapvault::fresh_error;
use snapvault::BackupAgent;
use snapvault::ChangeNotification;
use snapvault::Collaborators;
use snapvault::Options;
use snapvault::Result;
use std::io::BufRead;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(name = "snapvault", about = "continuous snapshot-based backups")]
/// snapvault reads its configuration (either "@/path/to/file.json"
/// or actual JSON) from the `SNAPVAULT_CONFIG` environment variable
/// by default; this can be overridden with the `--config` flag.
struct Opt {
    /// The snapvault JSON configuration.
    ///
    /// A value of the form "@/path/to/json.file" refers to the
    /// contents of that file; otherwise, the argument itself is the
    /// configuration string.
    #[clap(short, long)]
    config: Option<String>,

    /// Log level, in the same format as `RUST_LOG`.  Defaults to
    /// only logging errors to stderr; `--log=info` increases the
    /// verbosity to also log info and warning to stderr.
    ///
    /// To fully disable logging, pass `--log=off`.
    #[clap(short, long)]
    log: Option<String>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Backs up the changes listed on stdin, one per line, until EOF:
    /// "U <path>" for an update, "D <path>" for a deletion, and
    /// "M <from>\t<to>" for a move.
    Run,

    /// Backs up every file under the roots, then exits.
    Scan {
        #[clap(parse(from_os_str), required = true)]
        roots: Vec<PathBuf>,
    },

    /// Prints the replayed file state cache, one record per line.
    DumpCache,
}

/// Parses one line of `run` input.
fn parse_notification(line: &str) -> Option<ChangeNotification> {
    let (kind, rest) = line.split_once(' ')?;

    match kind {
        "U" => Some(ChangeNotification::Updated(rest.into())),
        "D" => Some(ChangeNotification::Deleted(rest.into())),
        "M" => {
            let (from, to) = rest.split_once('\t')?;
            Some(ChangeNotification::Moved {
                from: from.into(),
                to: to.into(),
            })
        }
        _ => None,
    }
}

fn run(agent: &BackupAgent) -> Result<()> {
    let notifier = agent.notifier();

    for line in std::io::stdin().lock().lines() {
        let line = line.map_err(|e| chain_error!(e, "failed to read stdin"))?;
        if line.is_empty() {
            continue;
        }

        match parse_notification(&line) {
            Some(notification) => notifier.notify(notification),
            None => tracing::warn!(%line, "ignoring malformed change notification"),
        }
    }

    agent.wait_until_idle();
    Ok(())
}

fn load_options(config: &Option<String>) -> Result<Options> {
    let options = if let Some(config) = config {
        snapvault::parse_configuration_string(config)
            .ok_or_else(|| fresh_error!("failed to parse --config"))?
    } else {
        let value = std::env::var(snapvault::SNAPVAULT_CONFIG_ENV_VAR)
            .map_err(|e| chain_error!(e, "failed to fetch the value of SNAPVAULT_CONFIG"))?;
        snapvault::parse_configuration_string(&value)
            .ok_or_else(|| fresh_error!("failed to parse SNAPVAULT_CONFIG", %value))?
    };

    options.validate()?;
    tracing::info!(?options, "parsed snapvault config");
    Ok(options)
}

pub fn main() -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let opts = Opt::parse();

    let filter = if let Some(log_level) = &opts.log {
        EnvFilter::try_new(log_level)
    } else {
        Ok(EnvFilter::from_default_env())
    }
    .expect("failed to parse --log level.");

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let options = load_options(&opts.config)?;

    if let Command::DumpCache = opts.cmd {
        for state in snapvault::load_cache_states(&options)? {
            println!("{}", state);
        }

        return Ok(());
    }

    let agent = BackupAgent::start(&options, Collaborators::from_options(&options)?)?;
    let result = match &opts.cmd {
        Command::Run => run(&agent),
        Command::Scan { roots } => agent.scan(roots).map(|count| {
            tracing::info!(count, "waiting for the scan to drain");
            agent.wait_until_idle();
        }),
        Command::DumpCache => Ok(()),
    };

    agent.stop();
    result
}
