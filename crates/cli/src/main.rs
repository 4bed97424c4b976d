mod config;
mod error;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use mcp::ServerConfig;
use runtime::{AnthropicBackend, Client};
use tracing_subscriber::EnvFilter;

use config::{CONFIG_FILE, Config};
use error::{Error, Result};

#[derive(Parser)]
#[command(name = "mcp-client")]
#[command(about = "Chat with a model that can call an MCP tool server", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./mcp-client.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tool server to launch: a .py or .js script, or an executable
    server: PathBuf,

    /// Extra arguments passed to the tool server
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let server = server_config(&cli.server, &cli.args, &config)?;
    let backend = config.backend()?;

    println!("mcp-client v{}", env!("CARGO_PKG_VERSION"));
    println!("Model: {}", config.backend.model);

    let mut client = Client::connect_with(&server, backend, config.connect_options()).await?;
    let result = chat_loop(&mut client).await;
    let cleanup = client.cleanup().await;

    result?;
    cleanup?;
    println!("\nDisconnected.");
    Ok(())
}

async fn chat_loop(client: &mut Client<AnthropicBackend>) -> Result<()> {
    if let Some(info) = client.server_info() {
        println!("Connected to {}", info.server_info.name);
    }
    let names: Vec<_> = client.catalog().names().collect();
    println!("Tools: {}", names.join(", "));
    println!("Type 'quit' or Ctrl+D to exit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }

        match client.process_query(input).await {
            Ok(outcome) => {
                println!("\n{}\n", outcome.text);
                tracing::debug!(
                    turns = outcome.turns,
                    tokens = outcome.usage.total_tokens(),
                    "query finished"
                );
            }
            Err(e) => {
                eprintln!("Error: {e}\n");
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Ok(Config::load(path)?),
        None if Path::new(CONFIG_FILE).exists() => Ok(Config::load(CONFIG_FILE)?),
        None => Ok(Config::default()),
    }
}

fn server_config(script: &Path, args: &[String], config: &Config) -> Result<ServerConfig> {
    if script.as_os_str().is_empty() {
        return Err(Error::MissingServer);
    }
    let mut server = ServerConfig::from_script(script).args(args.iter().cloned());
    for (key, value) in &config.server.env {
        server = server.env(key, value);
    }
    Ok(server)
}
