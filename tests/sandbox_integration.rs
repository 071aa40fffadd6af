//! Isolation behaviour that depends on kernel support.
//!
//! Each test checks what the coordinator reports as active and skips when
//! the host (often a container) does not allow unprivileged namespaces.

use coderunner::{ExecutionCoordinator, ExecutionRequest, RunnerConfig, SandboxMode};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn on_path(tool: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
        .unwrap_or(false)
}

fn isolated_config(root: &Path) -> RunnerConfig {
    let mut config = RunnerConfig {
        scratch_root: root.join("scratch"),
        min_free_bytes: 0,
        ..RunnerConfig::default()
    };
    config.sandbox.mode = SandboxMode::Permissive;
    config.sandbox.isolate_network = true;
    config.sandbox.isolate_filesystem = true;
    config.sandbox.isolate_processes = true;
    config.sandbox.use_cgroups = false;
    config
}

/// A string no other process on the host is likely to carry.
fn unique_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{}.{:09}", 3000 + std::process::id() % 1000, nanos)
}

/// Host pids whose command line mentions `needle`.
fn host_processes_with(needle: &str) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| {
            std::fs::read(format!("/proc/{pid}/cmdline"))
                .map(|raw| String::from_utf8_lossy(&raw).contains(needle))
                .unwrap_or(false)
        })
        .collect()
}

#[test]
fn test_network_namespace_has_only_loopback() {
    if !on_path("python3") {
        eprintln!("python3 not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(isolated_config(dir.path())).expect("coordinator");
    if !coordinator.runner().isolation().network {
        eprintln!("network namespaces unavailable, skipping");
        return;
    }

    let result = coordinator
        .execute(&ExecutionRequest::new(
            "python",
            "import socket\nprint(sorted(name for _, name in socket.if_nameindex()))\n",
        ))
        .expect("execute");
    assert!(result.success(), "stderr: {}", result.stderr_lossy());
    assert_eq!(result.stdout_lossy(), "['lo']\n");
}

#[test]
fn test_outbound_connections_fail() {
    if !on_path("python3") {
        eprintln!("python3 not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(isolated_config(dir.path())).expect("coordinator");
    if !coordinator.runner().isolation().network {
        eprintln!("network namespaces unavailable, skipping");
        return;
    }

    let code = "import socket\n\
                s = socket.socket()\n\
                s.settimeout(2)\n\
                try:\n    s.connect(('1.1.1.1', 80))\n    print('connected')\n\
                except OSError:\n    print('blocked')\n";
    let result = coordinator
        .execute(&ExecutionRequest::new("python", code))
        .expect("execute");
    assert_eq!(result.stdout_lossy(), "blocked\n");
}

#[test]
fn test_sibling_workspaces_are_invisible() {
    if !on_path("python3") {
        eprintln!("python3 not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(isolated_config(dir.path())).expect("coordinator");
    if !coordinator.runner().isolation().filesystem {
        eprintln!("mount namespaces unavailable, skipping");
        return;
    }

    let sibling = coordinator.workspaces().root().join("secret-sibling");
    std::fs::create_dir_all(&sibling).expect("mkdir");
    std::fs::write(sibling.join("answer.txt"), b"42").expect("write");

    let code = "import os\n\
                here = os.getcwd()\n\
                print(sorted(os.listdir(os.path.dirname(here))) == [os.path.basename(here)])\n\
                print(os.path.exists(os.path.join(os.path.dirname(here), 'secret-sibling')))\n";
    let result = coordinator
        .execute(&ExecutionRequest::new("python", code))
        .expect("execute");
    assert!(result.success(), "stderr: {}", result.stderr_lossy());
    assert_eq!(result.stdout_lossy(), "True\nFalse\n");

    // Still on the host side.
    assert!(sibling.join("answer.txt").is_file());
}

#[test]
fn test_workspace_is_writable_inside_sandbox() {
    if !on_path("python3") {
        eprintln!("python3 not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(isolated_config(dir.path())).expect("coordinator");
    if !coordinator.runner().isolation().filesystem {
        eprintln!("mount namespaces unavailable, skipping");
        return;
    }

    let code = "import os, tempfile\n\
                open('out.txt', 'w').write('data')\n\
                with tempfile.NamedTemporaryFile() as f:\n    f.write(b'x')\n\
                print(open('out.txt').read(), os.environ['HOME'] == os.getcwd())\n";
    let result = coordinator
        .execute(&ExecutionRequest::new("python", code))
        .expect("execute");
    assert!(result.success(), "stderr: {}", result.stderr_lossy());
    assert_eq!(result.stdout_lossy(), "data True\n");
    assert!(coordinator.workspaces().list().expect("list").is_empty());
}

#[test]
fn test_system_directories_are_read_only() {
    if !on_path("python3") {
        eprintln!("python3 not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(isolated_config(dir.path())).expect("coordinator");
    if !coordinator.runner().isolation().filesystem {
        eprintln!("mount namespaces unavailable, skipping");
        return;
    }

    let name = format!("coderunner-{}", unique_token());
    let code = format!(
        "for target in ('/etc/{name}', '/usr/{name}'):\n    try:\n        open(target, 'w').write('x')\n        print('written')\n    except OSError:\n        print('denied')\n"
    );
    let result = coordinator
        .execute(&ExecutionRequest::new("python", code))
        .expect("execute");
    assert!(result.success(), "stderr: {}", result.stderr_lossy());
    assert_eq!(result.stdout_lossy(), "denied\ndenied\n");
    assert!(!Path::new("/etc").join(&name).exists());
    assert!(!Path::new("/usr").join(&name).exists());
}

#[test]
fn test_shared_memory_is_private_to_each_run() {
    if !on_path("python3") {
        eprintln!("python3 not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(isolated_config(dir.path())).expect("coordinator");
    if !coordinator.runner().isolation().filesystem {
        eprintln!("mount namespaces unavailable, skipping");
        return;
    }

    let name = format!("coderunner-{}", unique_token());
    let writer = format!("open('/dev/shm/{name}', 'w').write('left behind')\nprint('ok')\n");
    let reader = format!("import os\nprint(os.path.exists('/dev/shm/{name}'))\n");

    let first = coordinator
        .execute(&ExecutionRequest::new("python", writer))
        .expect("writer");
    assert_eq!(first.stdout_lossy(), "ok\n", "stderr: {}", first.stderr_lossy());
    let second = coordinator
        .execute(&ExecutionRequest::new("python", reader))
        .expect("reader");
    assert_eq!(second.stdout_lossy(), "False\n", "stderr: {}", second.stderr_lossy());
    assert!(!Path::new("/dev/shm").join(&name).exists());
}

#[test]
fn test_detached_session_does_not_outlive_the_run() {
    if !on_path("python3") || !on_path("sleep") {
        eprintln!("python3 or sleep not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ExecutionCoordinator::new(isolated_config(dir.path())).expect("coordinator");
    let isolation = coordinator.runner().isolation();
    if !isolation.processes && !isolation.cgroups {
        eprintln!("neither pid namespaces nor cgroups available, skipping");
        return;
    }

    let token = unique_token();
    let code = format!(
        "import subprocess\n\
         subprocess.Popen(['sleep', '{token}'], start_new_session=True,\n\
                          stdin=subprocess.DEVNULL, stdout=subprocess.DEVNULL, stderr=subprocess.DEVNULL)\n\
         print('started')\n"
    );
    let result = coordinator
        .execute(&ExecutionRequest::new("python", code))
        .expect("execute");
    assert_eq!(result.stdout_lossy(), "started\n", "stderr: {}", result.stderr_lossy());

    std::thread::sleep(Duration::from_millis(200));
    let survivors = host_processes_with(&token);
    for pid in &survivors {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(*pid), nix::sys::signal::Signal::SIGKILL);
    }
    assert!(survivors.is_empty(), "detached sleep {token} survived as {survivors:?}");
}
