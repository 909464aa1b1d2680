use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rustyline::Editor;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vudo_runtime::{LoadOptions, Loader, Seance, SpiritSource};

#[derive(Parser)]
#[command(name = "vudo")]
#[command(about = "A host runtime for VUDO Spirits")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Load one Spirit, call a function, and print the result as JSON
    Run {
        /// Path or URI of the Spirit's Wasm module
        spirit: String,

        /// Function to call; defaults to `main` or the first export
        #[arg(long, short)]
        function: Option<String>,

        /// Arguments as a JSON array, e.g. '[10, 20]'
        #[arg(long, short, default_value = "[]")]
        args: String,

        /// Initial linear memory size in 64 KiB pages
        #[arg(long)]
        memory: Option<u32>,

        /// Forward `vudo_debug` output to the log
        #[arg(long)]
        debug: bool,
    },
    /// Summon the Spirits of one or more manifests and start an interactive session
    Seance {
        /// Séance manifest files (.toml)
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
    },
}

enum Commands {
    List,
    Invoke { target: String, args: Vec<String> },
    Release { spirit: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    match cli.mode {
        Mode::Run {
            spirit,
            function,
            args,
            memory,
            debug,
        } => run_spirit(&spirit, function, &args, memory, debug).await,
        Mode::Seance { manifests } => run_interactive_session(&manifests).await,
    }
}

async fn run_spirit(
    location: &str,
    function: Option<String>,
    args: &str,
    memory: Option<u32>,
    debug: bool,
) -> Result<()> {
    let args: Vec<serde_json::Value> =
        serde_json::from_str(args).context("--args must be a JSON array")?;

    let mut options = LoadOptions::default().with_debug(debug);
    if let Some(pages) = memory {
        let maximum = options.memory.maximum.max(pages);
        options = options.with_memory(pages, maximum);
    }

    let loader = Loader::new()?;
    let mut spirit = loader
        .load_from(&SpiritSource::parse(location), &options)
        .await?;

    let function = function
        .or_else(|| spirit.default_entry())
        .context("spirit exports no functions")?;
    let result = spirit.call_json(&function, args)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    spirit.release();
    Ok(())
}

async fn run_interactive_session(manifests: &[PathBuf]) -> Result<()> {
    println!("Loading manifests from: {manifests:?}...");
    let mut seance = Seance::new()?;
    let summoned = seance.summon_manifest(manifests).await?;
    println!("Summoned {} spirits.", summoned.len());

    println!("Starting interactive session. Type 'help' for commands.");
    let mut rl = Editor::<(), DefaultHistory>::new()?;
    loop {
        let readline = rl.readline("> ");
        match readline {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                if handle_command(&line, &mut seance).is_err() {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {err:?}");
                break;
            }
        }
    }

    seance.dismiss();
    Ok(())
}

fn handle_command(line: &str, seance: &mut Seance) -> Result<(), ()> {
    let parts = parse_quoted_args(line);

    let Some(command_str) = parts.first() else {
        return Ok(());
    };
    let command = match command_str.as_str() {
        "list" => Some(Commands::List),
        "invoke" => parts.get(1).map_or_else(
            || {
                eprintln!("Usage: invoke <spirit>.<function> [args...]");
                None
            },
            |target| {
                Some(Commands::Invoke {
                    target: target.to_string(),
                    args: parts.get(2..).unwrap_or(&[]).to_vec(),
                })
            },
        ),
        "release" => parts.get(1).map_or_else(
            || {
                eprintln!("Usage: release <spirit>");
                None
            },
            |spirit| {
                Some(Commands::Release {
                    spirit: spirit.to_string(),
                })
            },
        ),
        "help" => {
            println!("Available commands:");
            println!("  list                             - List summoned spirits and their functions");
            println!("  invoke <spirit>.<fn> [args...]   - Call a function with arguments");
            println!("  release <spirit>                 - Release a spirit");
            println!("  help                             - Show this help message");
            println!("  exit, quit                       - Exit the interactive session");
            None
        }
        "exit" | "quit" => return Err(()),
        _ => {
            eprintln!("Unknown command. Type 'help' for a list of commands.");
            None
        }
    };

    match command {
        Some(Commands::List) => {
            let mut targets = Vec::new();
            for name in seance.spirits() {
                if let Some(spirit) = seance.get_spirit(name) {
                    for function in spirit.list_functions() {
                        targets.push(format!("{name}.{function}"));
                    }
                }
            }
            targets.sort();
            for target in targets {
                println!("- {target}");
            }
        }
        Some(Commands::Invoke { target, args }) => {
            let Some((spirit, function)) = target.split_once('.') else {
                eprintln!("Error: Invalid target format. Use 'spirit.function'.");
                return Ok(());
            };
            // Parse as any valid JSON value, falling back to a string.
            let args = args
                .iter()
                .map(|arg| {
                    let trimmed = arg.trim();
                    serde_json::from_str(trimmed)
                        .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()))
                })
                .collect();
            match seance.invoke_json(spirit, function, args) {
                Ok(result) => match serde_json::to_string_pretty(&result) {
                    Ok(pretty) => println!("{pretty}"),
                    Err(e) => eprintln!("Error: {e}"),
                },
                Err(e) => eprintln!("Error: {e}"),
            }
        }
        Some(Commands::Release { spirit }) => match seance.release(&spirit) {
            Ok(()) => println!("Released {spirit}"),
            Err(e) => eprintln!("Error: {e}"),
        },
        None => {}
    }
    Ok(())
}

fn parse_quoted_args(line: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote_char: Option<char> = None;

    for ch in line.trim().chars() {
        match (ch, quote_char) {
            ('"', None) | ('\'', None) => quote_char = Some(ch),
            (ch, Some(open_char)) if ch == open_char => quote_char = None,
            (' ', None) => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            (ch, _) => current.push(ch),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
