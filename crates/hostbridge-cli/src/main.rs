mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{CommandError, Context};
use hostbridge_core::install_signal_handler;
use hostbridge_schema::{SessionConfig, Version};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "hostbridge",
    version,
    about = "Provision and launch native runtime bundles for a hosted game"
)]
struct Cli {
    /// Path to the bundle store. Overrides `store_root` from the session config.
    #[arg(long, global = true)]
    store: Option<String>,

    /// Session configuration file (hostbridge.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download, verify and install the bundles of a provisioning manifest.
    Provision {
        /// Path to the manifest TOML file.
        #[arg(default_value = "bundles.toml")]
        manifest: PathBuf,
        /// Provision only this bundle.
        #[arg(long)]
        bundle: Option<String>,
    },
    /// List every recorded bundle version.
    List,
    /// Re-hash installed and rollback trees and mark damaged ones corrupt.
    Verify,
    /// Reinstate the most recent superseded version of a bundle.
    Rollback {
        /// Bundle identifier.
        bundle: String,
    },
    /// Remove every version of a bundle and its partial downloads.
    Reset {
        /// Bundle identifier.
        bundle: String,
    },
    /// Remove stale staging, partial downloads and expired versions.
    Gc {
        /// Only report what would be removed.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Check the store and whether an installed bundle can run on this device.
    Doctor {
        /// Bundle identifier. Without it only the store is checked.
        bundle: Option<String>,
    },
    /// Launch the hosted runtime of an installed bundle and wait for it to end.
    Launch {
        /// Bundle identifier.
        bundle: String,
        /// Require this installed version.
        #[arg(long)]
        version: Option<Version>,
        /// Runtime backend: process or mock.
        #[arg(long, default_value = "process")]
        backend: String,
        /// Extra arguments for the hosted runtime (after --).
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("HOSTBRIDGE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let result = context(&cli).and_then(|ctx| match cli.command {
        Commands::Provision {
            ref manifest,
            ref bundle,
        } => commands::provision::run(&ctx, manifest, bundle.as_deref()),
        Commands::List => commands::list::run(&ctx),
        Commands::Verify => commands::verify::run(&ctx),
        Commands::Rollback { ref bundle } => commands::rollback::run(&ctx, bundle),
        Commands::Reset { ref bundle } => commands::reset::run(&ctx, bundle),
        Commands::Gc { dry_run } => commands::gc::run(&ctx, dry_run),
        Commands::Doctor { ref bundle } => commands::doctor::run(&ctx, bundle.as_deref()),
        Commands::Launch {
            ref bundle,
            ref version,
            ref backend,
            ref args,
        } => commands::launch::run(&ctx, bundle, version.clone(), backend, args),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    });

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {}", e.message);
            ExitCode::from(e.code)
        }
    }
}

fn context(cli: &Cli) -> Result<Context, CommandError> {
    let mut session = match cli.config {
        Some(ref path) => SessionConfig::load(path).map_err(CommandError::input)?,
        None => SessionConfig::default(),
    };
    session.store_root = match (&cli.store, &cli.config) {
        (Some(store), _) => expand_tilde(store),
        (None, Some(_)) => session.store_root,
        (None, None) => expand_tilde("~/.local/share/hostbridge"),
    };
    Ok(Context {
        session,
        json: cli.json,
    })
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
