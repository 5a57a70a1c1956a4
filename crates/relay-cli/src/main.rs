use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "relay",
    about = "RelayGrid — proxy mesh config compiler and usage accounting",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to relay.toml. Defaults apply when the file does not exist.
    #[arg(short, long, global = true, default_value = "relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a relay.toml scaffold
    Init {
        /// Directory holding the store and compiled artifacts
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
    },
    /// Upsert a topology snapshot (JSON) into the store
    Import {
        file: PathBuf,
    },
    /// Dump the store as a topology snapshot (JSON)
    Export {
        /// Output file (default: stdout)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Compile the runtime config of one node.
    ///
    /// Without --out, prints the config document. With --out, writes
    /// config.json, supervisor.conf and files.json into that directory.
    Compile {
        #[arg(short, long)]
        node: u64,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Decode an outbound tag; with --node, resolve it against the store
    DecodeTag {
        tag: String,
        #[arg(short, long)]
        node: Option<u64>,
    },
    /// Run one usage sync batch
    Sync,
    /// Run one flow point forward batch
    Forward,
    /// Ingest runtime traffic reports (one JSON report per line)
    IngestTraffic {
        #[arg(short, long)]
        node: u64,
        file: PathBuf,
    },
    /// Correlate runtime probe logs into connection health points
    HealthLog {
        #[arg(short, long)]
        node: u64,
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_cli=info".parse()?)
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = &cli.config;

    match cli.command {
        Commands::Init { path } => commands::topology::init(config, &path),
        Commands::Import { file } => commands::topology::import(config, &file),
        Commands::Export { out } => commands::topology::export(config, out.as_deref()),
        Commands::Compile { node, out } => commands::compile::compile(config, node, out.as_deref()),
        Commands::DecodeTag { tag, node } => commands::compile::decode_tag(config, &tag, node),
        Commands::Sync => commands::usage::sync(config).await,
        Commands::Forward => commands::usage::forward(config).await,
        Commands::IngestTraffic { node, file } => {
            commands::usage::ingest(config, node, &file).await
        }
        Commands::HealthLog { node, file } => commands::health::ingest(config, node, &file).await,
    }
}
