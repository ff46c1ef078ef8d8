use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::json;
use similar::{ChangeTag, TextDiff};
use std::env;
use std::io::Read;
use std::path::PathBuf;
use workspace_patcher::{parse_patch, FileChange, FileTools, Hunk, ToolInput};

#[derive(Parser)]
#[command(name = "workspace-patcher")]
#[command(about = "File mutation engine for AI coding agents", long_about = None)]
#[command(version)]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Session id scoping read records
    #[arg(short, long, global = true, default_value = "cli")]
    session: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace a text span in one file
    Edit {
        /// File to edit
        file: PathBuf,

        /// Text to find (fuzzy matching applies)
        old: String,

        /// Replacement text
        new: String,

        /// Replace every occurrence instead of requiring uniqueness
        #[arg(short, long)]
        all: bool,
    },

    /// Apply a multi-file patch
    Apply {
        /// Patch file to read (stdin if omitted)
        #[arg(short, long)]
        patch: Option<PathBuf>,
    },

    /// Drop this session's read records
    ClearSession,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => env::current_dir().context("cannot determine current directory")?,
    };
    let project_id = root.to_string_lossy().into_owned();
    let tools = FileTools::new(&root, project_id, &cli.session);

    match cli.command {
        Commands::Edit {
            file,
            old,
            new,
            all,
        } => cmd_edit(&tools, &file, &old, &new, all),
        Commands::Apply { patch } => cmd_apply(&tools, patch),
        Commands::ClearSession => {
            tools.clear_session().map_err(tool_error)?;
            println!("{}", "Session cleared".green());
            Ok(())
        }
    }
}

fn cmd_edit(tools: &FileTools, file: &PathBuf, old: &str, new: &str, all: bool) -> Result<()> {
    let path_arg = json!(file.to_string_lossy());

    // The CLI performs the read itself so the edit passes the
    // read-before-write guard.
    tools
        .file_read(&tool_input(&[("file_path", path_arg.clone())]))
        .map_err(tool_error)?;

    let output = tools
        .file_edit(&tool_input(&[
            ("file_path", path_arg),
            ("old_string", json!(old)),
            ("new_string", json!(new)),
            ("replace_all", json!(all)),
        ]))
        .map_err(tool_error)?;

    println!("{}", output.message.green());
    for change in &output.changes {
        print_diff(change);
    }
    Ok(())
}

fn cmd_apply(tools: &FileTools, patch_file: Option<PathBuf>) -> Result<()> {
    let text = match patch_file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read patch file {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("cannot read patch from stdin")?;
            buf
        }
    };

    // Record a read for every file the patch updates, then apply.
    let hunks = parse_patch(&text).map_err(|e| anyhow::anyhow!("{e}"))?;
    for hunk in &hunks {
        if let Hunk::Update { path, .. } = hunk {
            tools
                .file_read(&tool_input(&[("file_path", json!(path))]))
                .map_err(tool_error)?;
        }
    }

    let output = tools
        .file_patch(&tool_input(&[("patch", json!(text))]))
        .map_err(tool_error)?;

    println!("{}", output.message.green());
    for change in &output.changes {
        print_diff(change);
    }
    Ok(())
}

fn print_diff(change: &FileChange) {
    let before = change.before_content.as_deref().unwrap_or("");
    let after = change.after_content.as_deref().unwrap_or("");
    println!("{}", change.path.bold());

    let diff = TextDiff::from_lines(before, after);
    for line in diff.iter_all_changes() {
        match line.tag() {
            ChangeTag::Delete => print!("{}", format!("-{line}").red()),
            ChangeTag::Insert => print!("{}", format!("+{line}").green()),
            ChangeTag::Equal => {}
        }
    }
}

fn tool_input(pairs: &[(&str, serde_json::Value)]) -> ToolInput {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn tool_error(e: workspace_patcher::ToolError) -> anyhow::Error {
    anyhow::anyhow!("[{}] {}", e.code(), e)
}
