use crate::config::settings::{RunnerConfig, SandboxMode};
use crate::core::coordinator::ExecutionCoordinator;
use crate::core::types::ExecutionRequest;
use crate::judge::dependency::Dependency;
use crate::judge::registry::AdapterRegistry;
use crate::kernel::signal::ShutdownSignals;
use crate::utils::report::{render_legacy_text, termination_note, ExecutionReport};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "coderunner", author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Directory that holds per-request workspaces
    #[arg(long, global = true, value_name = "DIR")]
    scratch_root: Option<PathBuf>,
    /// Maximum number of executions running at once
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,
    /// Fail instead of degrading when an isolation layer is unavailable
    #[arg(long, global = true, conflicts_with = "permissive")]
    strict: bool,
    /// Degrade with a warning when an isolation layer is unavailable
    #[arg(long, global = true)]
    permissive: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program and print what it wrote
    Execute {
        /// Language identifier or alias (python, js, c++, ...)
        #[arg(long)]
        language: String,
        /// Source code as a string
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        code: Option<String>,
        /// Read the source code from a file
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
        /// Dependencies, separated by whitespace or commas
        #[arg(long)]
        deps: Option<String>,
        /// Data passed to the program on standard input
        #[arg(long)]
        stdin: Option<String>,
        /// Print the JSON report instead of the plain output
        #[arg(long)]
        json: bool,
        /// Wall-clock limit for the program in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// List supported languages and their aliases
    Languages,
    /// Check that every language toolchain is installed
    CheckDeps {
        /// Show the version reported by each tool
        #[arg(long)]
        verbose: bool,
    },
    /// Remove workspaces and cgroups left behind by crashed runs
    Cleanup {
        /// Only remove workspaces older than this
        #[arg(long, default_value_t = 3600)]
        max_age_secs: u64,
    },
}

pub fn run() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Execute {
            language,
            code,
            file,
            deps,
            stdin,
            json,
            timeout_ms,
        } => {
            let mut config = config;
            if let Some(timeout_ms) = timeout_ms {
                config.timeout_ms = timeout_ms;
            }
            let source = match (code, file) {
                (Some(code), _) => code,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (None, None) => anyhow::bail!("either --code or --file is required"),
            };
            let deps = Dependency::parse_list(deps.as_deref().unwrap_or(""))?;
            let mut request = ExecutionRequest::new(language, source).with_dependencies(deps);
            if let Some(stdin) = stdin {
                request = request.with_stdin(stdin.into_bytes());
            }
            execute(config, request, json)
        }
        Commands::Languages => {
            for adapter in AdapterRegistry::builtin().adapters() {
                if adapter.aliases().is_empty() {
                    println!("{}", adapter.language());
                } else {
                    println!("{} ({})", adapter.language(), adapter.aliases().join(", "));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::CheckDeps { verbose } => check_language_dependencies(permissive(config), verbose),
        Commands::Cleanup { max_age_secs } => {
            let coordinator = ExecutionCoordinator::new(permissive(config))?;
            let removed = coordinator
                .workspaces()
                .sweep_stale(Duration::from_secs(max_age_secs))?;
            println!(
                "Removed {} stale workspace(s) under {}",
                removed,
                coordinator.workspaces().root().display()
            );
            if let Some(cgroups) = coordinator.runner().cgroups() {
                let scopes = cgroups.sweep();
                println!(
                    "Removed {} leftover cgroup scope(s) under {}",
                    scopes,
                    cgroups.root().display()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(cli: &Cli) -> Result<RunnerConfig> {
    let mut config = match &cli.config {
        Some(path) => RunnerConfig::load_from_file(path)?,
        None => RunnerConfig::default(),
    };
    if let Some(root) = &cli.scratch_root {
        config.scratch_root = root.clone();
    }
    if let Some(max) = cli.max_concurrent {
        config.max_concurrent = max;
    }
    if cli.strict {
        config.sandbox.mode = SandboxMode::Strict;
    }
    if cli.permissive {
        config.sandbox.mode = SandboxMode::Permissive;
    }
    Ok(config)
}

/// Maintenance commands report what is missing instead of refusing to start.
fn permissive(mut config: RunnerConfig) -> RunnerConfig {
    config.sandbox.mode = SandboxMode::Permissive;
    config
}

fn execute(config: RunnerConfig, request: ExecutionRequest, json: bool) -> Result<ExitCode> {
    let signals = ShutdownSignals::install().map_err(anyhow::Error::msg)?;
    let coordinator = Arc::new(ExecutionCoordinator::new(config)?);
    let language = request.language.clone();

    let mut handle = coordinator.spawn(request);
    let mut cancelled = false;
    let outcome = loop {
        if let Some(outcome) = handle.wait_timeout(POLL_INTERVAL) {
            break outcome;
        }
        if !cancelled && signals.shutdown_requested() {
            warn!("signal {} received, cancelling execution", signals.received());
            handle.cancel();
            cancelled = true;
        }
    };

    if json {
        let report = ExecutionReport::from_outcome(&outcome).with_language(language);
        println!("{}", report.to_json()?);
    } else {
        print!("{}", render_legacy_text(&outcome));
        std::io::stdout().flush()?;
        if let Ok(result) = &outcome {
            if let Some(note) = termination_note(result) {
                eprintln!("[{}]", note);
            }
        }
    }

    let succeeded = matches!(&outcome, Ok(result) if result.success());
    info!("execution finished, success={}", succeeded);
    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Check every registered adapter's toolchain and the sandbox layers.
fn check_language_dependencies(config: RunnerConfig, verbose: bool) -> Result<ExitCode> {
    let coordinator = ExecutionCoordinator::new(config)?;
    let path_env = std::env::var("PATH").unwrap_or_default();

    println!("Checking language toolchains...");
    println!();

    let mut missing_languages = Vec::new();
    for adapter in coordinator.registry().adapters() {
        let mut lang_ok = true;
        let mut details = Vec::new();
        for tool in adapter.toolchain() {
            match find_on_path(tool, &path_env) {
                Some(path) => {
                    if verbose {
                        let version = tool_version(&path).unwrap_or_else(|| "unknown version".to_string());
                        details.push(format!("  {} -> {}", tool, version));
                    }
                }
                None => {
                    lang_ok = false;
                    details.push(format!("  {} -> NOT FOUND", tool));
                }
            }
        }

        if lang_ok {
            println!("OK       {}", adapter.language());
        } else {
            println!("MISSING  {}", adapter.language());
            missing_languages.push(adapter.language());
        }
        if verbose || !lang_ok {
            for line in details {
                println!("{}", line);
            }
        }
    }

    let isolation = coordinator.runner().isolation();
    println!();
    println!("Sandbox layers:");
    println!("  network namespace:    {}", on_off(isolation.network));
    println!("  filesystem isolation: {}", on_off(isolation.filesystem));
    println!("  pid/ipc namespaces:   {}", on_off(isolation.processes));
    println!("  cgroup limits:        {}", on_off(isolation.cgroups));
    if nix::unistd::geteuid().is_root() {
        println!("  root privilege drop:  {}", on_off(isolation.privileges_dropped));
    }
    println!();

    if missing_languages.is_empty() {
        println!("All language toolchains are installed.");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("Missing toolchains for: {}", missing_languages.join(", "));
        Ok(ExitCode::FAILURE)
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "unavailable"
    }
}

fn find_on_path(tool: &str, path_env: &str) -> Option<PathBuf> {
    std::env::split_paths(path_env)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// First line of the tool's version banner. JDK tools use `-version`.
fn tool_version(path: &Path) -> Option<String> {
    let flag = match path.file_name().and_then(|n| n.to_str()) {
        Some("java") | Some("javac") => "-version",
        _ => "--version",
    };
    let output = Command::new(path).arg(flag).output().ok()?;
    let text = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    String::from_utf8_lossy(&text)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_execute_requires_source() {
        assert!(Cli::try_parse_from(["coderunner", "execute", "--language", "python"]).is_err());
        assert!(Cli::try_parse_from([
            "coderunner",
            "execute",
            "--language",
            "python",
            "--code",
            "print(1)",
            "--file",
            "main.py",
        ])
        .is_err());
    }

    #[test]
    fn test_global_flags_override_config() {
        let cli = Cli::try_parse_from([
            "coderunner",
            "--scratch-root",
            "/var/lib/coderunner",
            "--max-concurrent",
            "2",
            "--strict",
            "languages",
        ])
        .expect("parse");
        let config = load_config(&cli).expect("config");
        assert_eq!(config.scratch_root, PathBuf::from("/var/lib/coderunner"));
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.sandbox.mode, SandboxMode::Strict);
    }

    #[test]
    fn test_strict_unless_permissive_requested() {
        let cli = Cli::try_parse_from(["coderunner", "languages"]).expect("parse");
        assert_eq!(load_config(&cli).expect("config").sandbox.mode, SandboxMode::Strict);

        let cli = Cli::try_parse_from(["coderunner", "--permissive", "languages"]).expect("parse");
        assert_eq!(load_config(&cli).expect("config").sandbox.mode, SandboxMode::Permissive);

        let config = permissive(RunnerConfig::default());
        assert_eq!(config.sandbox.mode, SandboxMode::Permissive);
    }

    #[test]
    fn test_find_on_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = dir.path().join("fake-tool");
        std::fs::write(&tool, b"#!/bin/sh\n").expect("write");
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let path_env = format!("/nonexistent:{}", dir.path().display());
        assert_eq!(find_on_path("fake-tool", &path_env), Some(tool));
        assert!(find_on_path("missing-tool", &path_env).is_none());
    }
}
