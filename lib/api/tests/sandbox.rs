use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use wasmer::wat2wasm;

use wasmbox::{
    ErrorClass, MemoryBackend, MountConfig, PersistenceConfig, PersistenceMode, Sandbox,
    SandboxConfig,
};

/// Shell stand-in that echoes the injected command back on stdout.
const COMMAND_ECHO_SHELL: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory 1)
  (export "memory" (memory 0))
  (func (export "alloc") (param $n i32) (result i32) (i32.const 4096))
  (func (export "run_command") (param $ptr i32) (param $len i32) (result i32)
    (i32.store (i32.const 0) (local.get $ptr))
    (i32.store (i32.const 4) (local.get $len))
    (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)) drop
    (i32.const 0)))
"#;

/// Shell stand-in that loops on a host import until unwound.
const SPIN_SHELL: &str = r#"
(module
  (import "wasmbox" "host_time_ms" (func $time (result i64)))
  (memory 1)
  (export "memory" (memory 0))
  (func (export "alloc") (param $n i32) (result i32) (i32.const 4096))
  (func (export "run_command") (param $ptr i32) (param $len i32) (result i32)
    (loop $l
      (drop (call $time))
      (br $l))
    (i32.const 0)))
"#;

fn shell_bundle(wat: &str) -> HashMap<String, Vec<u8>> {
    let mut bundle = HashMap::new();
    bundle.insert(
        "shell.wasm".to_string(),
        wat2wasm(wat.as_bytes()).unwrap().into_owned(),
    );
    bundle
}

#[test]
fn default_environment_and_layout() {
    let sandbox = Sandbox::new(SandboxConfig::default()).unwrap();
    assert_eq!(sandbox.get_env("HOME").unwrap(), "/home/user");
    assert_eq!(sandbox.get_env("PYTHONPATH").unwrap(), "/usr/lib/python");
    for dir in ["/home/user", "/tmp", "/bin", "/usr/bin", "/usr/lib/python", "/dev", "/proc"] {
        assert!(sandbox.stat(dir).unwrap().is_dir(), "{dir} missing");
    }
}

#[test]
fn python_path_is_prepended_to_default() {
    let config = SandboxConfig {
        python_path: vec!["/mnt/libs".to_string(), "/mnt/extra".to_string()],
        ..Default::default()
    };
    let sandbox = Sandbox::new(config).unwrap();
    assert_eq!(
        sandbox.get_env("PYTHONPATH").unwrap(),
        "/mnt/libs:/mnt/extra:/usr/lib/python"
    );
}

#[test]
fn proc_reflects_sandbox_environment() {
    let sandbox = Sandbox::new(SandboxConfig::default()).unwrap();
    sandbox.set_env("MARKER", "visible");
    let environ = sandbox.read_file("/proc/self/environ").unwrap();
    assert!(String::from_utf8_lossy(&environ).contains("MARKER=visible"));
}

#[test]
fn configured_mounts_are_readable() {
    let files: HashMap<String, Vec<u8>> =
        [("data.txt".to_string(), b"some data".to_vec())].into();
    let config = SandboxConfig {
        mounts: vec![MountConfig::files("/mnt/tools", files)],
        ..Default::default()
    };
    let sandbox = Sandbox::new(config).unwrap();
    assert_eq!(sandbox.read_file("/mnt/tools/data.txt").unwrap(), b"some data");
}

#[test]
fn write_then_read_round_trip() -> anyhow::Result<()> {
    let sandbox = Sandbox::new(SandboxConfig::default())?;
    sandbox.write_file("/home/user/t.txt", b"Hello\nLine 2.")?;
    assert_eq!(sandbox.read_file("/home/user/t.txt")?, b"Hello\nLine 2.");
    Ok(())
}

#[test]
fn fork_isolates_filesystem_and_environment() -> anyhow::Result<()> {
    let parent = Sandbox::new(SandboxConfig::default())?;
    parent.write_file("/tmp/shared.txt", b"base")?;
    parent.set_env("WHO", "parent");

    let child = parent.fork()?;
    child.write_file("/tmp/shared.txt", b"child")?;
    child.set_env("WHO", "child");

    assert_eq!(parent.read_file("/tmp/shared.txt")?, b"base");
    assert_eq!(parent.get_env("WHO").unwrap(), "parent");
    assert_eq!(child.read_file("/tmp/shared.txt")?, b"child");
    // The fork's /proc follows the fork's environment.
    let environ = child.read_file("/proc/self/environ")?;
    assert!(String::from_utf8_lossy(&environ).contains("WHO=child"));
    Ok(())
}

#[test]
fn fork_isolates_writable_mounts() -> anyhow::Result<()> {
    let config = SandboxConfig {
        mounts: vec![MountConfig::writable("/mnt/scratch", HashMap::new())],
        ..Default::default()
    };
    let parent = Sandbox::new(config)?;
    parent.write_file("/mnt/scratch/seed.txt", b"seed")?;

    let child = parent.fork()?;
    child.write_file("/mnt/scratch/seed.txt", b"child")?;
    child.write_file("/mnt/scratch/child.txt", b"c")?;
    parent.write_file("/mnt/scratch/parent.txt", b"p")?;

    assert_eq!(parent.read_file("/mnt/scratch/seed.txt")?, b"seed");
    assert!(parent.read_file("/mnt/scratch/child.txt").is_err());
    assert_eq!(child.read_file("/mnt/scratch/seed.txt")?, b"child");
    assert!(child.read_file("/mnt/scratch/parent.txt").is_err());
    Ok(())
}

#[test]
fn snapshot_restore_round_trip() -> anyhow::Result<()> {
    let sandbox = Sandbox::new(SandboxConfig::default())?;
    sandbox.write_file("/home/user/keep.txt", b"keep")?;
    let snap = sandbox.snapshot();
    sandbox.write_file("/home/user/keep.txt", b"dirty")?;
    sandbox.write_file("/home/user/junk.txt", b"junk")?;
    sandbox.restore(snap)?;
    assert_eq!(sandbox.read_file("/home/user/keep.txt")?, b"keep");
    assert!(sandbox.read_file("/home/user/junk.txt").is_err());
    Ok(())
}

#[test]
fn export_import_state_between_sandboxes() -> anyhow::Result<()> {
    let first = Sandbox::new(SandboxConfig::default())?;
    first.write_file("/home/user/doc.md", b"# saved")?;
    first.set_env("SESSION", "one");
    let blob = first.export_state();

    let second = Sandbox::new(SandboxConfig::default())?;
    second.import_state(&blob)?;
    assert_eq!(second.read_file("/home/user/doc.md")?, b"# saved");
    assert_eq!(second.get_env("SESSION").unwrap(), "one");
    Ok(())
}

#[test]
fn run_executes_the_shell_guest() {
    let config = SandboxConfig {
        module_bundle: shell_bundle(COMMAND_ECHO_SHELL),
        ..Default::default()
    };
    let sandbox = Sandbox::new(config).unwrap();
    let result = sandbox.run("echo hello world");
    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "echo hello world");
}

#[test]
fn default_timeout_applies_to_run() {
    let config = SandboxConfig {
        module_bundle: shell_bundle(SPIN_SHELL),
        timeout_ms: Some(100),
        ..Default::default()
    };
    let sandbox = Sandbox::new(config).unwrap();
    let result = sandbox.run("spin forever");
    assert_eq!(result.exit_code, 124);
    assert_eq!(result.error_class, Some(ErrorClass::Timeout));
}

#[test]
fn kill_cancels_inflight_run_and_next_run_succeeds() {
    let config = SandboxConfig {
        module_bundle: shell_bundle(SPIN_SHELL),
        ..Default::default()
    };
    let sandbox = Arc::new(Sandbox::new(config).unwrap());

    let runner = sandbox.clone();
    let running = std::thread::spawn(move || runner.run_with_deadline("spin", None));
    std::thread::sleep(Duration::from_millis(150));
    sandbox.kill();
    let result = running.join().unwrap();
    assert_eq!(result.exit_code, 125);
    assert_eq!(result.error_class, Some(ErrorClass::Cancelled));

    // The sandbox stays usable; the spin shell now runs into a deadline
    // instead of a cancellation.
    let result = sandbox.run_with_deadline("spin", Some(80));
    assert_eq!(result.exit_code, 124);
}

#[test]
fn session_persistence_autosaves_and_restores() -> anyhow::Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let config = SandboxConfig {
        persistence: PersistenceConfig {
            mode: PersistenceMode::Session,
            namespace: "suite".to_string(),
            autosave_ms: 20,
            backend: Some(backend.clone()),
        },
        ..Default::default()
    };
    {
        let sandbox = Sandbox::new(config)?;
        sandbox.write_file("/home/user/persisted.txt", b"across sessions")?;
        sandbox.set_env("RESTORED", "yes");
        std::thread::sleep(Duration::from_millis(250));
        assert!(backend.contains("suite"));
        sandbox.dispose();
    }

    let config = SandboxConfig {
        persistence: PersistenceConfig {
            mode: PersistenceMode::Session,
            namespace: "suite".to_string(),
            autosave_ms: 20,
            backend: Some(backend),
        },
        ..Default::default()
    };
    let revived = Sandbox::new(config)?;
    assert_eq!(
        revived.read_file("/home/user/persisted.txt")?,
        b"across sessions"
    );
    assert_eq!(revived.get_env("RESTORED").unwrap(), "yes");
    Ok(())
}

#[test]
fn mounted_files_never_reach_persisted_state() {
    let files: HashMap<String, Vec<u8>> =
        [("tool.txt".to_string(), b"mounted".to_vec())].into();
    let config = SandboxConfig {
        mounts: vec![MountConfig::files("/mnt/tools", files)],
        ..Default::default()
    };
    let sandbox = Sandbox::new(config).unwrap();
    sandbox.write_file("/home/user/real.txt", b"real").unwrap();
    let blob = sandbox.export_state();
    let text = String::from_utf8_lossy(&blob[12..]).into_owned();
    assert!(text.contains("/home/user/real.txt"));
    assert!(!text.contains("/mnt/tools"));
}

#[test]
fn file_count_limit_is_enforced() {
    let config = SandboxConfig {
        limits: wasmbox::Limits {
            file_count: 3,
            ..Default::default()
        },
        ..Default::default()
    };
    let sandbox = Sandbox::new(config).unwrap();
    sandbox.write_file("/tmp/1", b"x").unwrap();
    sandbox.write_file("/tmp/2", b"x").unwrap();
    sandbox.write_file("/tmp/3", b"x").unwrap();
    assert!(sandbox.write_file("/tmp/4", b"x").is_err());
}
