//! CLI module
//!
//! This module provides the command-line interface for taskstack: an interactive shell
//! that drives a [`Core`], plus read-only subcommands for browsing session history.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::{
    api::{Core, CoreError},
    config::StoreConfig,
    guide::{get_guide_string, GuideMode},
    logging,
    models::{NodeId, TreeState},
    store::SessionStore,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding the active session, event logs and snapshots
    #[arg(
        short,
        long,
        global = true,
        env = "TASKSTACK_DATA_DIR",
        default_value = ".taskstack"
    )]
    data_dir: PathBuf,

    /// Delay before a change is written to active.json, in milliseconds
    #[arg(long, global = true, default_value_t = 250)]
    debounce_ms: u64,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the interactive task shell
    Shell,

    /// List recorded sessions, newest first
    Sessions,

    /// Print the event log of a session
    Events {
        /// Session id (e.g. 2024-05-01_09-30-00)
        session_id: String,
    },

    /// List archived session snapshots, newest first
    Snapshots,

    /// Print the task tree stored in an archived snapshot
    Snapshot {
        /// Snapshot id (e.g. 2024-05-01_09-30-00)
        snapshot_id: String,
    },

    /// Print a guide to the shell and the files taskstack writes
    Guide,

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.data_dir.clone())
            .with_debounce(Duration::from_millis(self.debounce_ms))
    }
}

/// Run the CLI application
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let config = cli.store_config();

    match &cli.command {
        Commands::Shell => run_shell(config).await,

        Commands::Sessions => {
            let store = SessionStore::new(config);
            print_id_list("sessions", &store.list_sessions().await?);
            Ok(())
        }

        Commands::Events { session_id } => {
            let store = SessionStore::new(config);
            for line in store.read_events(session_id).await? {
                println!("{}", line);
            }
            Ok(())
        }

        Commands::Snapshots => {
            let store = SessionStore::new(config);
            print_id_list("snapshots", &store.list_snapshots().await?);
            Ok(())
        }

        Commands::Snapshot { snapshot_id } => {
            let store = SessionStore::new(config);
            let state = store.read_snapshot(snapshot_id).await?;
            print_tree(&state);
            Ok(())
        }

        Commands::Guide => {
            println!("{}", get_guide_string(GuideMode::Cli));
            Ok(())
        }

        Commands::Completions { shell } => {
            // Generate completions for the specified shell
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            generate(*shell, &mut cmd, bin_name, &mut io::stdout());
            Ok(())
        }
    }
}

/// A single line typed into the shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Add(String),
    Sibling(String),
    Rename(String),
    Focus(String),
    Done(Option<String>),
    Delete(Option<String>),
    Undo,
    Redo,
    Tree,
    Save,
    Restore(String),
    Sessions,
    Events(Option<String>),
    Snapshots,
    Help,
    Quit,
}

impl ShellCommand {
    /// Parses a shell line. Blank lines parse to `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let optional = || (!rest.is_empty()).then(|| rest.to_string());
        let required = |what: &str| {
            if rest.is_empty() {
                Err(format!("'{}' needs {}", word, what))
            } else {
                Ok(rest.to_string())
            }
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "add" | "a" => ShellCommand::Add(rest.to_string()),
            "sibling" | "s" => ShellCommand::Sibling(rest.to_string()),
            "rename" | "r" => ShellCommand::Rename(rest.to_string()),
            "focus" | "f" => ShellCommand::Focus(required("a node id")?),
            "done" | "complete" => ShellCommand::Done(optional()),
            "delete" | "rm" => ShellCommand::Delete(optional()),
            "undo" | "u" => ShellCommand::Undo,
            "redo" => ShellCommand::Redo,
            "tree" | "ls" => ShellCommand::Tree,
            "save" => ShellCommand::Save,
            "restore" => ShellCommand::Restore(required("a snapshot id")?),
            "sessions" => ShellCommand::Sessions,
            "events" => ShellCommand::Events(optional()),
            "snapshots" => ShellCommand::Snapshots,
            "help" | "?" => ShellCommand::Help,
            "quit" | "exit" | "q" => ShellCommand::Quit,
            other => return Err(format!("Unknown command '{}'. Type 'help'.", other)),
        };
        Ok(Some(command))
    }
}

async fn run_shell(config: StoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    let core = Core::start(config).await?;
    let state = core.get_state().await?;
    println!("Session {}", state.session_id.bold());
    print_tree(&state);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", ">".cyan());
        io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let command = match ShellCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                eprintln!("{}", message.red());
                continue;
            }
        };
        if command == ShellCommand::Quit {
            break;
        }
        if let Err(e) = execute(&core, command).await {
            eprintln!("{} {}", "error:".red().bold(), e);
        }
    }

    core.shutdown().await?;
    Ok(())
}

/// Runs one shell command against the core, printing its result
async fn execute(core: &Core, command: ShellCommand) -> Result<(), CoreError> {
    match command {
        ShellCommand::Add(title) => {
            let outcome = core.add_child(focused_id(core).await?, title).await?;
            print_tree(&outcome.state);
        }
        ShellCommand::Sibling(title) => {
            let outcome = core.add_sibling(focused_id(core).await?, title).await?;
            print_tree(&outcome.state);
        }
        ShellCommand::Rename(title) => {
            let state = core.rename_node(focused_id(core).await?, title).await?;
            print_tree(&state);
        }
        ShellCommand::Focus(id) => print_tree(&core.focus_node(id).await?),
        ShellCommand::Done(id) => {
            let id = match id {
                Some(id) => id,
                None => focused_id(core).await?,
            };
            print_tree(&core.complete_node(id).await?.state);
        }
        ShellCommand::Delete(id) => {
            let id = match id {
                Some(id) => id,
                None => focused_id(core).await?,
            };
            print_tree(&core.delete_node(id).await?.state);
        }
        ShellCommand::Undo => print_tree(&core.undo().await?),
        ShellCommand::Redo => print_tree(&core.redo().await?),
        ShellCommand::Tree => print_tree(&core.get_state().await?),
        ShellCommand::Save => {
            let state = core.save_session().await?;
            println!("Saved session {}; it will resume on next start.", state.session_id);
        }
        ShellCommand::Restore(snapshot_id) => {
            let state = core.restore_session(snapshot_id).await?;
            println!("Started session {}", state.session_id.bold());
            print_tree(&state);
        }
        ShellCommand::Sessions => print_id_list("sessions", &core.list_sessions().await?),
        ShellCommand::Events(session_id) => {
            let session_id = match session_id {
                Some(id) => id,
                None => core.get_state().await?.session_id,
            };
            for line in core.read_events(session_id).await? {
                println!("{}", line);
            }
        }
        ShellCommand::Snapshots => print_id_list("snapshots", &core.list_snapshots().await?),
        ShellCommand::Help => println!("{}", get_guide_string(GuideMode::Shell)),
        ShellCommand::Quit => {}
    }
    Ok(())
}

async fn focused_id(core: &Core) -> Result<NodeId, CoreError> {
    Ok(core.get_state().await?.focused_node_id)
}

fn print_id_list(what: &str, ids: &[String]) {
    if ids.is_empty() {
        println!("No {} recorded.", what);
        return;
    }
    for id in ids {
        println!("{}", id);
    }
}

/// Prints the active tree, marking the focused task
fn print_tree(state: &TreeState) {
    for line in render_tree(state) {
        println!("{}", line);
    }
    println!(
        "{}",
        format!(
            "undo: {}  redo: {}",
            state.undo_stack.len(),
            state.redo_stack.len()
        )
        .dimmed()
    );
}

fn render_tree(state: &TreeState) -> Vec<String> {
    let focused = state
        .focused_node()
        .map(|node| node.id.as_str())
        .unwrap_or_default();

    state
        .walk_active()
        .into_iter()
        .map(|(depth, node)| {
            let indent = "  ".repeat(depth);
            let id = format!("({})", node.id).dimmed();
            if node.id == focused {
                format!("{}{} {} {}", indent, "→".cyan(), node.title.bold(), id)
            } else {
                format!("{}  {} {}", indent, node.title, id)
            }
        })
        .collect()
}
