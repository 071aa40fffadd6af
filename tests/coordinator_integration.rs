//! End-to-end tests through the public coordinator API.
//!
//! These run real interpreters and skip themselves when the toolchain is
//! not installed. Isolation layers are turned off so the results do not
//! depend on what the host kernel allows; `sandbox_integration.rs` covers
//! those.

use coderunner::judge::adapter::PrepareContext;
use coderunner::{
    render_legacy_text, AdapterRegistry, Dependency, ExecutionCoordinator, ExecutionError,
    ExecutionRequest, LanguageAdapter, OverloadPolicy, RunCommand, RunnerConfig, SandboxMode,
    Termination,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn on_path(tool: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
        .unwrap_or(false)
}

macro_rules! require_tool {
    ($tool:expr) => {
        if !on_path($tool) {
            eprintln!("{} not found on PATH, skipping", $tool);
            return;
        }
    };
}

fn plain_config(root: &Path) -> RunnerConfig {
    let mut config = RunnerConfig {
        scratch_root: root.join("scratch"),
        min_free_bytes: 0,
        ..RunnerConfig::default()
    };
    config.sandbox.mode = SandboxMode::Permissive;
    config.sandbox.isolate_network = false;
    config.sandbox.isolate_filesystem = false;
    config.sandbox.isolate_processes = false;
    config.sandbox.use_cgroups = false;
    config
}

fn assert_no_workspaces(coordinator: &ExecutionCoordinator) {
    assert_eq!(coordinator.workspaces().live_count(), 0);
    assert!(
        coordinator.workspaces().list().expect("list").is_empty(),
        "workspace directories left behind"
    );
}

#[test]
fn test_python_fibonacci() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(plain_config(dir.path())).expect("coordinator");

    let code = "def fib(n):\n    return n if n < 2 else fib(n - 1) + fib(n - 2)\nprint(fib(10))\n";
    let result = coordinator
        .execute(&ExecutionRequest::new("python", code))
        .expect("execute");

    assert!(result.success(), "stderr: {}", result.stderr_lossy());
    assert_eq!(result.stdout_lossy(), "55\n");
    assert_eq!(result.termination, Termination::Exited);
    assert!(!result.timed_out);
    assert_no_workspaces(&coordinator);
}

#[test]
fn test_python_fibonacci_sequence() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(plain_config(dir.path())).expect("coordinator");

    let code = "a, b = 0, 1\nout = []\nfor _ in range(10):\n    out.append(a)\n    a, b = b, a + b\nprint(' '.join(map(str, out)))\n";
    let result = coordinator
        .execute(&ExecutionRequest::new("python", code))
        .expect("execute");

    assert_eq!(result.stdout_lossy(), "0 1 1 2 3 5 8 13 21 34\n");
    assert_eq!(result.exit_code, Some(0));
    assert!(result.stderr.is_empty(), "stderr: {}", result.stderr_lossy());
    assert_no_workspaces(&coordinator);
}

#[test]
fn test_same_request_gives_same_output() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(plain_config(dir.path())).expect("coordinator");

    let request = ExecutionRequest::new(
        "python",
        "import os\nprint(sorted(os.listdir('.')))\nprint(sum(i * i for i in range(1000)))\n",
    );
    let first = coordinator.execute(&request).expect("first");
    let second = coordinator.execute(&request).expect("second");

    assert!(first.success(), "stderr: {}", first.stderr_lossy());
    assert_eq!(first.stdout, second.stdout);
    assert_eq!(first.exit_code, second.exit_code);
    assert_no_workspaces(&coordinator);
}

#[test]
fn test_language_aliases_resolve() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(plain_config(dir.path())).expect("coordinator");

    let result = coordinator
        .execute(&ExecutionRequest::new("  PY ", "print('alias')"))
        .expect("execute");
    assert_eq!(result.stdout_lossy(), "alias\n");
}

#[test]
fn test_unsupported_language_text() {
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(plain_config(dir.path())).expect("coordinator");

    let outcome = coordinator.execute(&ExecutionRequest::new("cobol", "DISPLAY 'HELLO'."));
    assert!(matches!(outcome, Err(ExecutionError::UnsupportedLanguage(_))));
    assert_eq!(render_legacy_text(&outcome), "Unsupported language: cobol");
    assert_no_workspaces(&coordinator);
}

#[test]
fn test_runtime_error_keeps_both_streams() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(plain_config(dir.path())).expect("coordinator");

    let outcome = coordinator.execute(&ExecutionRequest::new(
        "python",
        "print('before')\nraise ValueError('boom')\n",
    ));
    let result = outcome.as_ref().expect("execute");
    assert!(!result.success());
    assert_eq!(result.exit_code, Some(1));
    assert_eq!(result.termination, Termination::Exited);

    let text = render_legacy_text(&outcome);
    assert!(text.starts_with("before\n"));
    assert!(text.contains("ValueError: boom"));
}

#[test]
fn test_stdin_reaches_program() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(plain_config(dir.path())).expect("coordinator");

    let request = ExecutionRequest::new("python", "import sys\nprint(sum(int(x) for x in sys.stdin.read().split()))")
        .with_stdin(b"1 2 3 4\n".to_vec());
    let result = coordinator.execute(&request).expect("execute");
    assert_eq!(result.stdout_lossy(), "10\n");
}

#[test]
fn test_infinite_loop_times_out_and_is_cleaned_up() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = plain_config(dir.path());
    config.timeout_ms = 2000;
    let coordinator = ExecutionCoordinator::new(config).expect("coordinator");

    let started = Instant::now();
    let result = coordinator
        .execute(&ExecutionRequest::new(
            "python",
            "import time\nprint('start', flush=True)\nwhile True:\n    time.sleep(0.05)\n",
        ))
        .expect("execute");
    let elapsed = started.elapsed();

    assert!(result.timed_out);
    assert_eq!(result.termination, Termination::TimedOut);
    assert_eq!(result.exit_code, None);
    assert!(result.wall_time_ms >= 2000);
    assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");
    assert_eq!(result.stdout_lossy(), "start\n");
    assert_no_workspaces(&coordinator);
}

#[test]
fn test_background_children_are_killed_with_the_program() {
    require_tool!("python3");
    require_tool!("sleep");
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = plain_config(dir.path());
    config.timeout_ms = 1000;
    let coordinator = ExecutionCoordinator::new(config).expect("coordinator");

    let started = Instant::now();
    let result = coordinator
        .execute(&ExecutionRequest::new(
            "python",
            "import subprocess\nsubprocess.Popen(['sleep', '30'])\nprint('spawned', flush=True)\n",
        ))
        .expect("execute");

    // The orphan holds no pipe open past the kill, so collection returns promptly.
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.stdout_lossy(), "spawned\n");
    assert_no_workspaces(&coordinator);
}

#[test]
fn test_output_is_truncated_at_the_cap() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = plain_config(dir.path());
    config.max_output_bytes = 1024;
    let coordinator = ExecutionCoordinator::new(config).expect("coordinator");

    let result = coordinator
        .execute(&ExecutionRequest::new("python", "print('x' * 200000)"))
        .expect("execute");

    assert!(result.output_truncated);
    assert!(result.stdout.len() + result.stderr.len() <= 1024);
    assert!(result.stdout.iter().all(|b| *b == b'x'));
    assert_eq!(result.termination, Termination::Exited);
    assert_no_workspaces(&coordinator);
}

#[test]
fn test_concurrent_requests_get_separate_workspaces() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = plain_config(dir.path());
    config.max_concurrent = 4;
    let coordinator = Arc::new(ExecutionCoordinator::new(config).expect("coordinator"));

    let workers: Vec<_> = (0..4)
        .map(|n| {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || {
                let code = format!(
                    "import os, time\n\
                     open('marker.txt', 'w').write('{n}')\n\
                     time.sleep(0.3)\n\
                     print(os.getcwd())\n\
                     print(open('marker.txt').read())\n\
                     print(len(os.listdir('.')))\n"
                );
                coordinator
                    .execute(&ExecutionRequest::new("python", code))
                    .expect("execute")
            })
        })
        .collect();

    let mut cwds = Vec::new();
    for (n, worker) in workers.into_iter().enumerate() {
        let result = worker.join().expect("join");
        let stdout = result.stdout_lossy();
        let lines: Vec<&str> = stdout.lines().collect();
        assert_eq!(lines.len(), 3, "unexpected output: {stdout}");
        assert_eq!(lines[1], n.to_string());
        cwds.push(lines[0].to_string());
    }
    cwds.sort();
    cwds.dedup();
    assert_eq!(cwds.len(), 4, "workspaces were shared");
    assert_no_workspaces(&coordinator);
}

#[test]
fn test_busy_when_capacity_is_exhausted() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = plain_config(dir.path());
    config.max_concurrent = 1;
    config.overload_policy = OverloadPolicy::Reject;
    let coordinator = Arc::new(ExecutionCoordinator::new(config).expect("coordinator"));

    let long = coordinator.spawn(ExecutionRequest::new("python", "import time\ntime.sleep(1.5)\n"));
    let deadline = Instant::now() + Duration::from_secs(5);
    while coordinator.in_flight() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(coordinator.in_flight(), 1);

    let err = coordinator
        .execute(&ExecutionRequest::new("python", "print(1)"))
        .unwrap_err();
    assert_eq!(err.kind(), "busy");

    let result = long.wait().expect("long request");
    assert!(result.success());
    assert_eq!(coordinator.in_flight(), 0);
    assert_no_workspaces(&coordinator);
}

#[test]
fn test_queued_request_runs_when_slot_frees() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = plain_config(dir.path());
    config.max_concurrent = 1;
    config.queue_wait_ms = 20_000;
    let coordinator = Arc::new(ExecutionCoordinator::new(config).expect("coordinator"));

    let first = coordinator.spawn(ExecutionRequest::new("python", "import time\ntime.sleep(0.5)\nprint('first')"));
    let second = coordinator.spawn(ExecutionRequest::new("python", "print('second')"));

    assert_eq!(first.wait().expect("first").stdout_lossy(), "first\n");
    assert_eq!(second.wait().expect("second").stdout_lossy(), "second\n");
    assert_no_workspaces(&coordinator);
}

#[test]
fn test_no_workspace_leaks_across_outcomes() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = plain_config(dir.path());
    config.timeout_ms = 500;
    let coordinator = ExecutionCoordinator::new(config).expect("coordinator");

    let requests = [
        ExecutionRequest::new("python", "print('ok')"),
        ExecutionRequest::new("python", "def broken(:\n"),
        ExecutionRequest::new("python", "while True: pass\n"),
        ExecutionRequest::new("python", "import sys\nsys.exit(7)\n"),
        ExecutionRequest::new("brainfuck", "+++."),
    ];
    for request in &requests {
        let _ = coordinator.execute(request);
        assert_no_workspaces(&coordinator);
    }
}

/// Adapter whose run command points at a binary that does not exist.
struct MissingBinaryAdapter;

impl LanguageAdapter for MissingBinaryAdapter {
    fn language(&self) -> &'static str {
        "missing"
    }

    fn extension(&self) -> &'static str {
        "txt"
    }

    fn toolchain(&self) -> &'static [&'static str] {
        &["coderunner-no-such-binary"]
    }

    fn build_run_command(&self, ctx: &PrepareContext<'_>, source: &Path) -> coderunner::Result<RunCommand> {
        Ok(RunCommand::new(
            [
                "/nonexistent/coderunner-no-such-binary".to_string(),
                source.to_string_lossy().into_owned(),
            ],
            ctx.workspace.path(),
        ))
    }
}

#[test]
fn test_no_workspace_leaks_on_launch_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registry = AdapterRegistry::builtin();
    registry
        .register(Arc::new(MissingBinaryAdapter))
        .expect("register");
    let coordinator =
        ExecutionCoordinator::with_registry(plain_config(dir.path()), registry).expect("coordinator");

    for _ in 0..2 {
        let err = coordinator
            .execute(&ExecutionRequest::new("missing", "anything"))
            .unwrap_err();
        assert_eq!(err.kind(), "launch");
        assert_no_workspaces(&coordinator);
    }
}

#[test]
fn test_no_workspace_leaks_on_dependency_failure() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let packages = dir.path().join("packages");
    std::fs::create_dir_all(&packages).expect("mkdir");

    let mut config = plain_config(dir.path());
    config.local_dependency_roots = vec![packages.clone()];
    let coordinator = ExecutionCoordinator::new(config).expect("coordinator");

    // Inside the allowed root, but never created.
    let absent = Dependency::LocalPath(packages.join("absent"));
    let request = ExecutionRequest::new("python", "print(1)").with_dependencies(vec![absent]);
    let err = coordinator.execute(&request).unwrap_err();
    assert_eq!(err.kind(), "dependency");
    assert_no_workspaces(&coordinator);
}

#[test]
fn test_cancel_running_request() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = plain_config(dir.path());
    config.timeout_ms = 30_000;
    let coordinator = Arc::new(ExecutionCoordinator::new(config).expect("coordinator"));

    let started = Instant::now();
    let handle = coordinator.spawn(ExecutionRequest::new("python", "while True: pass\n"));
    thread::sleep(Duration::from_millis(300));
    handle.cancel();

    match handle.wait() {
        Ok(result) => {
            assert_eq!(result.termination, Termination::Cancelled);
            assert!(!result.timed_out);
        }
        Err(err) => assert_eq!(err.kind(), "cancelled"),
    }
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_no_workspaces(&coordinator);
}

#[test]
fn test_c_compile_error_is_reported() {
    require_tool!("gcc");
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(plain_config(dir.path())).expect("coordinator");

    let outcome = coordinator.execute(&ExecutionRequest::new("c", "int main( { return 0; }\n"));
    let err = outcome.as_ref().unwrap_err();
    assert_eq!(err.kind(), "compile");
    let diagnostics = err.captured_output().expect("compiler output");
    assert!(!diagnostics.stderr.is_empty());
    assert!(render_legacy_text(&outcome).contains("error"));
    assert_no_workspaces(&coordinator);
}

#[test]
fn test_c_program_runs() {
    require_tool!("gcc");
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(plain_config(dir.path())).expect("coordinator");

    let code = "#include <stdio.h>\n#include <math.h>\nint main(void) { printf(\"%.0f\\n\", sqrt(81.0)); return 0; }\n";
    let result = coordinator
        .execute(&ExecutionRequest::new("c", code))
        .expect("execute");
    assert!(result.success(), "stderr: {}", result.stderr_lossy());
    assert_eq!(result.stdout_lossy(), "9\n");
}

#[test]
fn test_local_python_dependency_is_importable() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let packages = dir.path().join("packages");
    std::fs::create_dir_all(packages.join("helper")).expect("mkdir");
    std::fs::write(packages.join("helper/__init__.py"), b"ANSWER = 42\n").expect("write");

    let mut config = plain_config(dir.path());
    config.local_dependency_roots = vec![packages.clone()];
    let coordinator = ExecutionCoordinator::new(config).expect("coordinator");

    let deps = coderunner::Dependency::parse_list(&packages.join("helper").display().to_string())
        .expect("deps");
    let request = ExecutionRequest::new("python", "import helper\nprint(helper.ANSWER)\n")
        .with_dependencies(deps);
    let result = coordinator.execute(&request).expect("execute");
    assert_eq!(result.stdout_lossy(), "42\n", "stderr: {}", result.stderr_lossy());
    assert_no_workspaces(&coordinator);
}

#[test]
fn test_same_named_local_dependencies_stay_separate() {
    require_tool!("python3");
    let dir = tempfile::tempdir().expect("tempdir");
    let roots: Vec<PathBuf> = ["team-a", "team-b"]
        .iter()
        .map(|team| {
            let root = dir.path().join(team);
            std::fs::create_dir_all(root.join("mylib")).expect("mkdir");
            std::fs::write(
                root.join("mylib/__init__.py"),
                format!("OWNER = '{team}'\n").as_bytes(),
            )
            .expect("write");
            root
        })
        .collect();

    let mut config = plain_config(dir.path());
    config.max_concurrent = 2;
    config.local_dependency_roots = roots.clone();
    let coordinator = Arc::new(ExecutionCoordinator::new(config).expect("coordinator"));

    let workers: Vec<_> = roots
        .iter()
        .map(|root| {
            let coordinator = Arc::clone(&coordinator);
            let dep = Dependency::LocalPath(root.join("mylib"));
            thread::spawn(move || {
                let request = ExecutionRequest::new(
                    "python",
                    "import time, mylib\ntime.sleep(0.3)\nimport mylib\nprint(mylib.OWNER)\n",
                )
                .with_dependencies(vec![dep]);
                coordinator.execute(&request).expect("execute")
            })
        })
        .collect();

    let owners: Vec<String> = workers
        .into_iter()
        .map(|w| w.join().expect("join").stdout_lossy())
        .collect();
    assert_eq!(owners, vec!["team-a\n".to_string(), "team-b\n".to_string()]);
    assert_no_workspaces(&coordinator);
}
