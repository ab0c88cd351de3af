use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::net::IpAddr;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "skua")]
#[command(author, version)]
#[command(
    about = "An interception proxy that records HTTP/HTTPS traffic as HAR",
    long_about = "skua sits between a client and the network, optionally decrypting HTTPS, \
                  applying traffic policies, and recording every exchange as an HTTP Archive (HAR)."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy and write the captured HAR on Ctrl+C
    Proxy {
        /// Port to listen on
        #[arg(short, long, env = "SKUA_PORT")]
        port: Option<u16>,

        /// Address to bind
        #[arg(long, env = "SKUA_BIND")]
        bind: Option<IpAddr>,

        /// Where to write the HAR file
        #[arg(short, long, value_name = "FILE", default_value = "capture.har")]
        output: PathBuf,

        /// JSON configuration file; flags override its values
        #[arg(short, long, value_name = "FILE", env = "SKUA_CONFIG")]
        config: Option<PathBuf>,

        /// CA certificate (PEM) used to impersonate hosts
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// CA private key (PEM)
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,

        /// Tunnel HTTPS without decrypting it
        #[arg(long, conflicts_with = "chained_proxy")]
        no_mitm: bool,

        /// Skip upstream certificate verification
        #[arg(long)]
        trust_all_servers: bool,

        /// Forward traffic through an upstream proxy (host:port)
        #[arg(long, value_name = "HOST:PORT", env = "SKUA_CHAINED_PROXY")]
        chained_proxy: Option<String>,

        /// Delay every response by this many milliseconds
        #[arg(long, value_name = "MS")]
        latency_ms: Option<u64>,

        /// Capture flags (e.g. request-headers, response-content); repeatable
        #[arg(long = "capture", value_name = "TYPE", value_delimiter = ',')]
        capture: Vec<String>,
    },

    /// Generate shell completion scripts
    #[command(long_about = "Generate shell completion scripts for skua.

SUPPORTED SHELLS:
    bash, zsh, fish, powershell, elvish

INSTALLATION:
    Bash:
        skua completion --shell bash > ~/.local/share/bash-completion/completions/skua
        # or add to ~/.bashrc:
        eval \"$(skua completion --shell bash)\"

    Zsh:
        skua completion --shell zsh > \"${fpath[1]}/_skua\"
        # or add to ~/.zshrc:
        eval \"$(skua completion --shell zsh)\"

    Fish:
        skua completion --shell fish > ~/.config/fish/completions/skua.fish

    PowerShell:
        skua completion --shell powershell >> $PROFILE")]
    Completion {
        /// Shell to generate completions for
        #[arg(short, long, value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Proxy {
            port,
            bind,
            output,
            config,
            cert,
            key,
            no_mitm,
            trust_all_servers,
            chained_proxy,
            latency_ms,
            capture,
        } => commands::proxy::execute(commands::proxy::ProxyArgs {
            port,
            bind,
            output,
            config,
            cert,
            key,
            no_mitm,
            trust_all_servers,
            chained_proxy,
            latency_ms,
            capture,
        }),
        Commands::Completion { shell } => commands::completion::execute(shell, &mut Cli::command()),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("skua=debug,skua_core=debug,skua_proxy=debug")
    } else {
        EnvFilter::new("skua=info,skua_proxy=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}
