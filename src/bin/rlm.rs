//! RLM CLI - Query large files with recursive LLM executions
//!
//! Usage:
//!   rlm <file> <query> [--model <model>] [--base-url <url>] [--verbose]
//!
//! Example:
//!   rlm war-and-peace.txt "What is the secret passphrase?" --verbose
//!   rlm large-log.txt "How many ERROR lines?" --depth 2

use anyhow::{Context, Result};
use colored::Colorize;
use rlm_engine::executor::{ExecutionRequest, Executor};
use rlm_engine::provider::OpenAiCompatProvider;
use rlm_engine::sandbox::{DirectHost, PythonInterpreterProvider};
use rlm_engine::tree::{ExecutionEvent, TreeState};
use rlm_engine::{
    CompletionProvider, ExecutorConfig, InterpreterProvider, NodeStatus, SandboxConfig,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DEFAULT_MODEL: &str = "deepseek-chat";
const DEFAULT_BASE_URL: &str = "http://localhost:4000/v1";

fn print_usage() {
    eprintln!(
        r#"
{} - Query large files with Recursive Language Models

{}
    rlm <FILE> <QUERY> [OPTIONS]

{}
    <FILE>     Path to the file to analyze
    <QUERY>    Question to ask about the file

{}
    -m, --model <MODEL>         Model to use (default: deepseek-chat)
    -u, --base-url <URL>        OpenAI-compatible endpoint (default: http://localhost:4000/v1)
    -k, --api-key <KEY>         API key (or set RLM_API_KEY env var)
    -d, --depth <N>             Maximum delegation depth (default: 1)
    -n, --max-iterations <N>    Maximum loop iterations per node (default: 100)
    --python <BIN>              Python interpreter for the sandbox (default: python3)
    -v, --verbose               Show live execution events
    -vv                         Extra verbose (show full prompts and responses)
    -h, --help                  Print this help message

{}
    rlm document.txt "What is the main topic?"
    rlm logs.txt "Count the ERROR lines" -m gpt-4o-mini
    rlm war-and-peace.txt "Find the hidden passphrase" -vv -d 2

{}
    The model writes a Python program that explores your file in a sandbox.
    When the program calls llm_query(), execution pauses, the sub-question is
    answered by a fresh model call (or a recursive sub-execution), and the
    program resumes with the answer cached. The loop ends when the program
    reports its final answer.
"#,
        "RLM CLI".bold(),
        "USAGE:".bold(),
        "ARGS:".bold(),
        "OPTIONS:".bold(),
        "EXAMPLES:".bold(),
        "HOW IT WORKS:".bold(),
    );
}

struct CliArgs {
    file: PathBuf,
    query: String,
    model: String,
    base_url: String,
    api_key: Option<String>,
    max_depth: u32,
    max_iterations: usize,
    python_bin: String,
    verbose: u8, // 0=off, 1=verbose, 2=extra verbose
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 || args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        print_usage();
        std::process::exit(if args.iter().any(|a| a == "--help" || a == "-h") {
            0
        } else {
            1
        });
    }

    let file = PathBuf::from(&args[1]);
    let query = args[2].clone();

    let mut model = DEFAULT_MODEL.to_string();
    let mut base_url = DEFAULT_BASE_URL.to_string();
    let mut api_key = std::env::var("RLM_API_KEY").ok();
    let mut max_depth = 1;
    let mut max_iterations = 100;
    let mut python_bin = "python3".to_string();
    let mut verbose: u8 = 0;

    let mut i = 3;
    while i < args.len() {
        match args[i].as_str() {
            "--model" | "-m" => {
                i += 1;
                if i < args.len() {
                    model = args[i].clone();
                }
            }
            "--base-url" | "-u" => {
                i += 1;
                if i < args.len() {
                    base_url = args[i].clone();
                }
            }
            "--api-key" | "-k" => {
                i += 1;
                if i < args.len() {
                    api_key = Some(args[i].clone());
                }
            }
            "--depth" | "-d" => {
                i += 1;
                if i < args.len() {
                    max_depth = args[i].parse().unwrap_or(1);
                }
            }
            "--max-iterations" | "-n" => {
                i += 1;
                if i < args.len() {
                    max_iterations = args[i].parse().unwrap_or(100);
                }
            }
            "--python" => {
                i += 1;
                if i < args.len() {
                    python_bin = args[i].clone();
                }
            }
            "--verbose" | "-v" => {
                verbose = verbose.max(1);
            }
            "-vv" => {
                verbose = 2;
            }
            _ => {}
        }
        i += 1;
    }

    CliArgs {
        file,
        query,
        model,
        base_url,
        api_key,
        max_depth,
        max_iterations,
        python_bin,
        verbose,
    }
}

fn print_header(args: &CliArgs, file_size: usize, line_count: usize) {
    eprintln!();
    eprintln!(
        "{}",
        "╭──────────────────────────────────────────────────────────────╮".blue()
    );
    eprintln!(
        "{}  {}                   {}",
        "│".blue(),
        "RLM CLI - Recursive Language Model Query".bold(),
        "│".blue()
    );
    eprintln!(
        "{}",
        "├──────────────────────────────────────────────────────────────┤".blue()
    );
    eprintln!(
        "{}  {}   {}",
        "│".blue(),
        "File:".dimmed(),
        args.file.display()
    );
    eprintln!(
        "{}  {}   {} chars ({} lines, ~{} tokens)",
        "│".blue(),
        "Size:".dimmed(),
        file_size,
        line_count,
        file_size / 4
    );
    eprintln!(
        "{}  {}  {} @ {}",
        "│".blue(),
        "Model:".dimmed(),
        args.model,
        args.base_url
    );
    eprintln!(
        "{}  {}  {} (max delegation depth {})",
        "│".blue(),
        "Query:".dimmed(),
        preview(&args.query, 50),
        args.max_depth
    );
    eprintln!(
        "{}",
        "╰──────────────────────────────────────────────────────────────╯".blue()
    );
    eprintln!();
}

fn preview(text: &str, limit: usize) -> String {
    if text.chars().count() > limit {
        let cut: String = text.chars().take(limit).collect();
        format!("{}... ({} chars total)", cut, text.len())
    } else {
        text.to_string()
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn print_event(event: &ExecutionEvent, verbose: u8) {
    match event {
        ExecutionEvent::NodeCreated { node } => {
            let indent = "  ".repeat(node.depth as usize);
            if node.depth == 0 {
                eprintln!(
                    "{}{} root node {}",
                    indent,
                    "●".cyan(),
                    short_id(&node.id).dimmed()
                );
                if verbose >= 2 && !node.code.is_empty() {
                    eprintln!("{}", "  ▼ Generated program:".blue());
                    for line in node.code.lines() {
                        eprintln!("    {}", line.green());
                    }
                }
            } else {
                eprintln!(
                    "{}{} delegation {} (depth {})",
                    indent,
                    "●".cyan(),
                    short_id(&node.id).dimmed(),
                    node.depth
                );
            }
        }
        ExecutionEvent::NodeStatusChanged { node_id, status } => {
            if verbose >= 2 {
                let label = match status {
                    NodeStatus::Executing => "executing".yellow(),
                    NodeStatus::LlmCalling => "llm-calling".magenta(),
                    NodeStatus::Completed => "completed".green(),
                    NodeStatus::Error => "error".red(),
                    NodeStatus::Pending => "pending".dimmed(),
                };
                eprintln!("  {} {} → {}", "·".dimmed(), short_id(node_id).dimmed(), label);
            }
        }
        ExecutionEvent::NodeOutputAppended { node_id, text } => {
            eprintln!("  {} output from {}:", "◀".magenta(), short_id(node_id).dimmed());
            let limit = if verbose >= 2 { 2000 } else { 300 };
            for line in preview(text.trim_end(), limit).lines() {
                eprintln!("    {}", line.cyan());
            }
        }
        ExecutionEvent::DelegationStarted { node_id, prompt } => {
            let limit = if verbose >= 2 { 2000 } else { 120 };
            eprintln!(
                "  {} {} asks: {}",
                "▶".yellow(),
                short_id(node_id).dimmed(),
                preview(prompt, limit).yellow()
            );
        }
        ExecutionEvent::DelegationFinished { node_id, response } => {
            let limit = if verbose >= 2 { 2000 } else { 120 };
            eprintln!(
                "  {} {} answered: {}",
                "✓".green(),
                short_id(node_id).dimmed(),
                preview(response, limit)
            );
        }
        ExecutionEvent::NodeErrored { node_id, error } => {
            eprintln!(
                "  {} {} failed: {}",
                "✗".red(),
                short_id(node_id).dimmed(),
                error.red()
            );
        }
        ExecutionEvent::ExecutionComplete { .. } | ExecutionEvent::ExecutionError { .. } => {}
    }
    let _ = std::io::stderr().flush();
}

fn print_results(answer: &str, tree: &TreeState, context_chars: usize) {
    let delegations = tree.nodes.values().filter(|n| n.depth > 0).count();
    let max_depth_seen = tree.nodes.values().map(|n| n.depth).max().unwrap_or(0);

    eprintln!();
    eprintln!(
        "{}",
        "╭──────────────────────────────────────────────────────────────╮".green()
    );
    eprintln!(
        "{}  {}                                                     {}",
        "│".green(),
        "Results".bold(),
        "│".green()
    );
    eprintln!(
        "{}",
        "├──────────────────────────────────────────────────────────────┤".green()
    );
    eprintln!(
        "{}  {}    {}",
        "│".green(),
        "Tree nodes:".dimmed(),
        tree.nodes.len()
    );
    eprintln!(
        "{}  {}   {}",
        "│".green(),
        "Delegations:".dimmed(),
        delegations
    );
    eprintln!(
        "{}  {}   {}",
        "│".green(),
        "Max depth:".dimmed(),
        max_depth_seen
    );
    eprintln!(
        "{}  {}  {} chars",
        "│".green(),
        "Context:".dimmed(),
        context_chars
    );
    eprintln!(
        "{}",
        "╰──────────────────────────────────────────────────────────────╯".green()
    );
    eprintln!();
    eprintln!("{}", "Answer:".bold());
    eprintln!(
        "{}",
        "════════════════════════════════════════════════════════════════".green()
    );
    println!("{answer}");
    eprintln!(
        "{}",
        "════════════════════════════════════════════════════════════════".green()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let context = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read file: {}", args.file.display()))?;

    let file_size = context.len();
    let line_count = context.lines().count();

    print_header(&args, file_size, line_count);

    let provider: Arc<dyn CompletionProvider> = Arc::new(OpenAiCompatProvider::new(
        &args.base_url,
        args.api_key.clone(),
        &args.model,
    ));
    let interpreter_provider: Arc<dyn InterpreterProvider> =
        Arc::new(PythonInterpreterProvider::new(&args.python_bin));
    let host = Arc::new(DirectHost::new(interpreter_provider));

    let executor_cfg = ExecutorConfig {
        max_iterations: args.max_iterations,
        max_depth: args.max_depth,
        ..ExecutorConfig::default()
    };
    let sandbox_cfg = SandboxConfig {
        python_bin: args.python_bin.clone(),
        ..SandboxConfig::default()
    };

    let executor = Arc::new(Executor::new(provider, host, executor_cfg, sandbox_cfg));

    if args.verbose > 0 {
        eprintln!("{}", "Starting RLM execution...".dimmed());
        eprintln!();
        let _ = std::io::stderr().flush();
    }

    let request = ExecutionRequest {
        query: args.query.clone(),
        context: context.clone(),
        context_id: None,
        max_depth: Some(args.max_depth),
    };

    let mut rx = executor.execute_with_delegation(request, CancellationToken::new());

    let mut events = Vec::new();
    let mut outcome: Result<String, String> = Err("execution produced no result".to_string());
    while let Some(event) = rx.recv().await {
        if args.verbose > 0 {
            print_event(&event, args.verbose);
        }
        match &event {
            ExecutionEvent::ExecutionComplete { result } => {
                outcome = Ok(result.clone());
            }
            ExecutionEvent::ExecutionError { error } => {
                outcome = Err(error.clone());
            }
            _ => {}
        }
        events.push(event);
    }

    let tree = TreeState::fold(events.iter());

    match outcome {
        Ok(answer) => {
            print_results(&answer, &tree, file_size);
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_on_char_boundaries() {
        // Two-byte chars put every odd byte offset inside a character;
        // truncation must count chars, never slice bytes.
        let query = "é".repeat(60);
        let shown = preview(&query, 50);
        assert!(shown.starts_with(&"é".repeat(50)));
        assert!(shown.contains("120 chars total"));
    }

    #[test]
    fn preview_leaves_short_text_untouched() {
        assert_eq!(preview("short query", 50), "short query");
    }
}
