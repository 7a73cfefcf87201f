//! mcpfleet - talk to many MCP servers from the command line.
//!
//! Loads a server registry, opens the sessions a command needs, and closes
//! every session before exiting, including on Ctrl-C.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mcpfleet::{ClientOptions, McpConfig, McpError, SessionManager};

/// Multi-server MCP client
#[derive(Parser)]
#[command(name = "mcpfleet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Server registry (JSON with an `mcpServers` object, or TOML)
    #[arg(short, long, global = true, env = "MCPFLEET_CONFIG", default_value = "mcp.json")]
    config: PathBuf,

    /// Runtime options file (TOML)
    #[arg(long, global = true, env = "MCPFLEET_OPTIONS")]
    options: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured servers without connecting
    Servers,

    /// Connect and list tools
    Tools {
        /// Only this server
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Call one tool
    Call {
        /// Server name
        server: String,

        /// Tool name
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },

    /// List a server's resources
    Resources {
        /// Server name
        server: String,
    },

    /// Run a script in code mode against every configured server
    Exec {
        /// Script file, or `-` for stdin
        file: String,

        /// Execution timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<McpError>() {
                Some(mcp) => eprintln!("{}", mcp.report()),
                None => eprintln!("error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = McpConfig::from_file(&cli.config)?;
    let mut options = match &cli.options {
        Some(path) => ClientOptions::from_file(path)?,
        None => ClientOptions::default(),
    };
    if matches!(cli.command, Commands::Exec { .. }) {
        options = options.with_code_mode();
    }

    let manager = SessionManager::builder(config).options(options).build();

    // The only signal handler in the process; the manager itself registers none.
    let outcome = tokio::select! {
        result = dispatch(&manager, cli.command, cli.format) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    manager.shutdown().await;
    outcome
}

async fn dispatch(manager: &SessionManager, command: Commands, format: Format) -> Result<()> {
    match command {
        Commands::Servers => cmd_servers(manager, format),
        Commands::Tools { server } => cmd_tools(manager, server, format).await,
        Commands::Call { server, tool, args } => cmd_call(manager, &server, &tool, args, format).await,
        Commands::Resources { server } => cmd_resources(manager, &server, format).await,
        Commands::Exec { file, timeout_ms } => cmd_exec(manager, &file, timeout_ms, format).await,
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_servers(manager: &SessionManager, format: Format) -> Result<()> {
    let servers: Vec<_> = manager
        .server_names()
        .into_iter()
        .filter_map(|name| manager.server_config(&name))
        .collect();

    if format == Format::Json {
        let rows: Vec<Value> = servers
            .iter()
            .map(|c| {
                serde_json::json!({
                    "name": c.name,
                    "transport": c.transport_kind().to_string(),
                    "url": c.transport.url(),
                })
            })
            .collect();
        return print_json(&rows);
    }

    if servers.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }
    for config in servers {
        let target = match config.transport.url() {
            Some(url) => url.to_string(),
            None => String::new(),
        };
        println!("{:<24} {:<10} {}", config.name, config.transport_kind(), target);
    }
    Ok(())
}

async fn cmd_tools(manager: &SessionManager, server: Option<String>, format: Format) -> Result<()> {
    match server {
        Some(name) => {
            manager.create_session(&name).await?;
        }
        None => {
            let report = manager.create_all_sessions().await;
            for (name, error) in &report.failures {
                eprintln!("{}: {}", name, error.report());
            }
        }
    }

    let tools = manager.list_tools();
    if format == Format::Json {
        return print_json(&tools);
    }
    for (server, tools) in tools {
        for tool in tools {
            let description = tool.description.as_deref().unwrap_or_default();
            let first_line = description.lines().next().unwrap_or_default();
            println!("{}.{:<32} {}", server, tool.name, first_line);
        }
    }
    Ok(())
}

fn parse_args(args: Option<String>) -> Result<Option<HashMap<String, Value>>> {
    let Some(text) = args else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(&text).context("--args is not valid JSON")? {
        Value::Object(map) => Ok(Some(map.into_iter().collect())),
        _ => bail!("--args must be a JSON object"),
    }
}

async fn cmd_call(
    manager: &SessionManager,
    server: &str,
    tool: &str,
    args: Option<String>,
    format: Format,
) -> Result<()> {
    let arguments = parse_args(args)?;
    manager.create_session(server).await?;
    let result = manager.call_tool(server, tool, arguments).await?;

    if format == Format::Json {
        print_json(&result)?;
    } else {
        println!("{}", result.text_content());
    }
    if result.is_error() {
        bail!("tool '{}' reported an error", tool);
    }
    Ok(())
}

async fn cmd_resources(manager: &SessionManager, server: &str, format: Format) -> Result<()> {
    let session = manager.create_session(server).await?;
    let resources = session.resources();
    if format == Format::Json {
        return print_json(&resources);
    }
    for resource in resources {
        println!("{:<48} {}", resource.uri, resource.name);
    }
    Ok(())
}

async fn cmd_exec(manager: &SessionManager, file: &str, timeout_ms: Option<u64>, format: Format) -> Result<()> {
    let code = if file == "-" {
        let mut code = String::new();
        io::stdin().read_to_string(&mut code).context("failed to read script from stdin")?;
        code
    } else {
        std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file))?
    };

    let report = manager.create_all_sessions().await;
    for (name, error) in &report.failures {
        eprintln!("{}: {}", name, error.report());
    }

    let result = manager.execute_code(&code, timeout_ms).await?;
    if format == Format::Json {
        print_json(&result)?;
    } else {
        for line in &result.logs {
            println!("{}", line);
        }
        if let Some(value) = &result.result {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
    }

    if let Some(error) = &result.error {
        let kind = result.error_kind.map(|k| k.to_string()).unwrap_or_else(|| "ExecutionError".to_string());
        bail!("{}: {}", kind, error);
    }
    Ok(())
}
