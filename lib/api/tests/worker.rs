//! Worker-mode execution: the guest runs on a background thread against
//! a VFS proxy while the real tree stays on this side.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use wasmer::wat2wasm;

use wasmbox::{ErrorClass, Sandbox, SandboxConfig};

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

/// Writes a file through `host_write_file`; in worker mode that call
/// crosses the proxy channel to the real filesystem.
const WRITER_SHELL: &str = r#"
(module
  (import "wasmbox" "host_write_file"
    (func $write_file (param i32 i32 i32 i32 i32) (result i32)))
  (memory 1)
  (export "memory" (memory 0))
  (data (i32.const 100) "/tmp/from-worker")
  (data (i32.const 130) "proxied write")
  (func (export "alloc") (param $n i32) (result i32) (i32.const 4096))
  (func (export "run_command") (param $ptr i32) (param $len i32) (result i32)
    (call $write_file (i32.const 100) (i32.const 16) (i32.const 130) (i32.const 13) (i32.const 0))))
"#;

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

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn worker_sandbox(shell_wat: &str) -> Sandbox {
    init_tracing();
    let mut bundle = HashMap::new();
    bundle.insert(
        "shell.wasm".to_string(),
        wat2wasm(shell_wat.as_bytes()).unwrap().into_owned(),
    );
    Sandbox::new(SandboxConfig {
        module_bundle: bundle,
        use_worker: true,
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn worker_runs_commands_off_thread() {
    let sandbox = worker_sandbox(COMMAND_ECHO_SHELL);
    let result = sandbox.run("echo from the worker");
    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "echo from the worker");

    // The worker is reused across runs.
    let result = sandbox.run("second");
    assert_eq!(result.stdout, "second");
}

#[test]
fn worker_writes_reach_the_real_tree_through_the_proxy() {
    let sandbox = worker_sandbox(WRITER_SHELL);
    let result = sandbox.run("ignored");
    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
    assert_eq!(
        sandbox.read_file("/tmp/from-worker").unwrap(),
        b"proxied write"
    );
}

#[test]
fn worker_deadline_returns_timeout() {
    let sandbox = worker_sandbox(SPIN_SHELL);
    let started = Instant::now();
    let result = sandbox.run_with_deadline("spin", Some(100));
    assert_eq!(result.exit_code, 124);
    assert_eq!(result.error_class, Some(ErrorClass::Timeout));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn kill_resolves_inflight_run_with_cancelled() {
    let sandbox = Arc::new(worker_sandbox(SPIN_SHELL));
    let runner = sandbox.clone();
    let running = std::thread::spawn(move || runner.run_with_deadline("spin", None));
    std::thread::sleep(Duration::from_millis(150));
    sandbox.kill();
    let result = running.join().unwrap();
    assert_eq!(result.exit_code, 125);
    assert_eq!(result.error_class, Some(ErrorClass::Cancelled));

    // A fresh worker serves the next run.
    let result = sandbox.run_with_deadline("spin", Some(80));
    assert_eq!(result.exit_code, 124);
}
