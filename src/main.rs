use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use solotab::build_info::long_version;
use solotab::commands::run::RunOptions;
use solotab::commands::{Backend, Context};
use solotab::config::{ConflictPolicy, GuardConfig};
use solotab::output::Format;

#[derive(Parser)]
#[command(
    name = "solotab",
    version = long_version(),
    about = "Keep exactly one tab active across processes sharing a registry"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Shorthand for --format pretty
    #[arg(long, global = true, hide = true)]
    pretty: bool,
    /// Directory holding the shared registry
    #[arg(long, global = true, default_value = ".solotab")]
    dir: PathBuf,
    /// Storage backend for the registry
    #[arg(long, global = true, value_enum, default_value = "file")]
    backend: Backend,
    /// Registry key (overrides the config file)
    #[arg(long, global = true)]
    key: Option<String>,
    /// YAML or JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Verbose protocol logging on stderr
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hold a tab open and print its transitions
    Run {
        /// Tab id (generated if omitted)
        #[arg(long)]
        id: Option<String>,
        /// Leave after this many milliseconds (default: until closed)
        #[arg(long)]
        duration_ms: Option<u64>,
        /// Never raise a conflict
        #[arg(long)]
        allow_multiple: bool,
        /// What to do after losing the election
        #[arg(long, value_enum)]
        policy: Option<ConflictPolicy>,
        /// Target for the redirect policy
        #[arg(long)]
        redirect_url: Option<String>,
        /// Take leadership right after starting
        #[arg(long)]
        claim: bool,
        /// Also report tabs coming and going
        #[arg(long)]
        observe: bool,
        /// Check interval in milliseconds
        #[arg(long)]
        check_ms: Option<u64>,
        /// Heartbeat interval in milliseconds
        #[arg(long)]
        heartbeat_ms: Option<u64>,
        /// Milliseconds without a heartbeat before a tab counts as gone
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// List registered tabs
    List {
        /// Include expired records
        #[arg(long)]
        all: bool,
    },
    /// Remove expired records from the registry
    Prune,
    /// Show which live tab currently wins the election
    Leader,
    /// Report tabs coming and going without registering one
    Watch {
        /// Stop after this many milliseconds
        #[arg(long, default_value_t = 5000)]
        duration_ms: u64,
    },
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "warn" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .try_init();
}

fn load_config(cli: &Cli) -> solotab::Result<GuardConfig> {
    let mut config = match &cli.config {
        Some(path) => GuardConfig::load(path)?,
        None => GuardConfig::default(),
    };
    if let Some(key) = &cli.key {
        config.storage_key = key.clone();
    }
    config.debug |= cli.debug;
    Ok(config)
}

fn run(cli: Cli, format: Format) -> solotab::Result<()> {
    let config = load_config(&cli)?;
    let mut ctx = Context {
        dir: cli.dir,
        backend: cli.backend,
        config,
        format,
    };

    match cli.command {
        Commands::Run {
            id,
            duration_ms,
            allow_multiple,
            policy,
            redirect_url,
            claim,
            observe,
            check_ms,
            heartbeat_ms,
            timeout_ms,
        } => {
            let config = &mut ctx.config;
            config.allow_multiple_tabs |= allow_multiple;
            config.observe_tabs |= observe;
            if let Some(policy) = policy {
                config.policy = policy;
            }
            if redirect_url.is_some() {
                config.redirect_url = redirect_url;
            }
            if let Some(ms) = check_ms {
                config.check_interval_ms = ms;
            }
            if let Some(ms) = heartbeat_ms {
                config.heartbeat_interval_ms = ms;
            }
            if let Some(ms) = timeout_ms {
                config.tab_timeout_ms = ms;
            }
            let opts = RunOptions {
                id,
                duration: duration_ms.map(Duration::from_millis),
                claim,
            };
            solotab::commands::run::run(&ctx, opts)
        }
        Commands::List { all } => solotab::commands::list::run(&ctx, all),
        Commands::Prune => solotab::commands::prune::run(&ctx),
        Commands::Leader => solotab::commands::leader::run(&ctx),
        Commands::Watch { duration_ms } => {
            ctx.config.observe_tabs = true;
            solotab::commands::watch::run(&ctx, Duration::from_millis(duration_ms))
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);
    let format = if cli.pretty {
        Format::Pretty
    } else {
        cli.format
    };
    if let Err(e) = run(cli, format) {
        match format {
            Format::Json => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "error": e.code(),
                        "message": e.to_string()
                    })
                );
            }
            _ => eprintln!("error: {e}"),
        }
        std::process::exit(1);
    }
}
