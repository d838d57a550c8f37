//! toolmux CLI entry point.
//!
//! Dispatches to `serve` (run the gateway on stdio) or `resolve` (print a
//! server entry from the template registry).

use clap::{Parser, Subcommand};

use toolmux::cli::{ResolveArgs, ServeArgs};
use toolmux::server::{run_resolve, run_serve};

/// toolmux: many MCP servers behind one gateway.
#[derive(Parser)]
#[command(name = "toolmux", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway, serving the aggregated namespace on stdio.
    Serve(ServeArgs),
    /// Look up a registry template and print a server entry for it.
    Resolve(ResolveArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Serve(args) => {
            init_tracing(args.verbose);
            match run_serve(args).await {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!(error = %e, "serve failed");
                    eprintln!("toolmux serve: {e}");
                    1
                }
            }
        }
        Commands::Resolve(args) => {
            init_tracing(false);
            run_resolve(&args)
        }
    };

    std::process::exit(code);
}

/// Initialise the tracing subscriber on stderr.
///
/// Stdout belongs to the protocol; everything human-facing goes to
/// stderr. When `verbose` is set the filter is forced to `debug`,
/// otherwise `RUST_LOG` decides.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
