//! Behavioral tests driving the preview-1 host with WAT micro-guests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use wasmer::{wat2wasm, FunctionEnv, Instance, Module, Store};

use wasmbox_vfs::{FileSystem, Vfs};
use wasmbox_wasi::{build_imports, CancelToken, ExitCode, Interrupt, WasiEnv};

struct Outcome {
    exit: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_truncated: bool,
    interrupt: Option<Interrupt>,
}

#[allow(clippy::too_many_arguments)]
fn run_guest(
    wat: &str,
    vfs: &Vfs,
    args: &[&str],
    env_vars: &[(&str, &str)],
    stdin: &[u8],
    output_limit: usize,
    deadline: Option<Duration>,
    cancel: CancelToken,
) -> Outcome {
    let mut store = Store::default();
    let module = Module::new(&store, wat2wasm(wat.as_bytes()).unwrap()).unwrap();
    let wasi = WasiEnv::new(
        Arc::new(vfs.clone()),
        args.iter().map(|s| s.to_string()).collect(),
        env_vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        "/".to_string(),
        stdin.to_vec(),
        output_limit,
        deadline.map(|d| Instant::now() + d),
        cancel,
    );
    let env = FunctionEnv::new(&mut store, wasi);
    let imports = build_imports(&mut store, &env);
    let instance = Instance::new(&mut store, &module, &imports).unwrap();
    let memory = instance.exports.get_memory("memory").unwrap().clone();
    env.as_mut(&mut store).memory = Some(memory);
    let start = instance.exports.get_function("_start").unwrap().clone();

    let (exit, interrupt) = match start.call(&mut store, &[]) {
        Ok(_) => (0, None),
        Err(err) => match err.downcast::<ExitCode>() {
            Ok(ExitCode(code)) => (code, None),
            Err(err) => match err.downcast::<Interrupt>() {
                Ok(reason) => (-1, Some(reason)),
                Err(other) => panic!("unexpected trap: {other}"),
            },
        },
    };
    let ((stdout, stdout_truncated), (stderr, _)) = env.as_mut(&mut store).take_outputs();
    Outcome {
        exit,
        stdout,
        stderr,
        stdout_truncated,
        interrupt,
    }
}

fn run_simple(wat: &str, vfs: &Vfs) -> Outcome {
    run_guest(
        wat,
        vfs,
        &["guest"],
        &[],
        b"",
        1 << 20,
        None,
        CancelToken::new(),
    )
}

const HELLO: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory 1)
  (export "memory" (memory 0))
  (data (i32.const 8) "hello world\n")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 8))
    (i32.store (i32.const 4) (i32.const 12))
    (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 20))
    drop))
"#;

#[test]
fn fd_write_reaches_stdout_capture() {
    let vfs = Vfs::new();
    let out = run_simple(HELLO, &vfs);
    assert_eq!(out.exit, 0);
    assert_eq!(out.stdout, b"hello world\n");
    assert_eq!(out.stderr, b"");
    assert!(!out.stdout_truncated);
}

#[test]
fn proc_exit_code_is_surfaced() {
    let wat = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory 1)
  (export "memory" (memory 0))
  (func (export "_start")
    (call $proc_exit (i32.const 7))))
"#;
    let vfs = Vfs::new();
    let out = run_simple(wat, &vfs);
    assert_eq!(out.exit, 7);
}

#[test]
fn stdin_round_trips_through_fd_read() {
    let wat = r#"
(module
  (import "wasi_snapshot_preview1" "fd_read" (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory 1)
  (export "memory" (memory 0))
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 1024))
    (i32.store (i32.const 4) (i32.const 256))
    (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 8))
    drop
    (i32.store (i32.const 16) (i32.const 1024))
    (i32.store (i32.const 20) (i32.load (i32.const 8)))
    (call $fd_write (i32.const 1) (i32.const 16) (i32.const 1) (i32.const 12))
    drop))
"#;
    let vfs = Vfs::new();
    let out = run_guest(
        wat,
        &vfs,
        &["cat"],
        &[],
        b"piped input",
        1 << 20,
        None,
        CancelToken::new(),
    );
    assert_eq!(out.exit, 0);
    assert_eq!(out.stdout, b"piped input");
}

#[test]
fn argv_marshaling_matches_wire_format() {
    let wat = r#"
(module
  (import "wasi_snapshot_preview1" "args_sizes_get" (func $args_sizes_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "args_get" (func $args_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory 1)
  (export "memory" (memory 0))
  (func (export "_start")
    (call $args_sizes_get (i32.const 0) (i32.const 4)) drop
    (call $args_get (i32.const 16) (i32.const 512)) drop
    (i32.store (i32.const 8) (i32.const 512))
    (i32.store (i32.const 12) (i32.load (i32.const 4)))
    (call $fd_write (i32.const 1) (i32.const 8) (i32.const 1) (i32.const 0)) drop))
"#;
    let vfs = Vfs::new();
    let out = run_guest(
        wat,
        &vfs,
        &["echo", "hello", "world"],
        &[],
        b"",
        1 << 20,
        None,
        CancelToken::new(),
    );
    assert_eq!(out.exit, 0);
    assert_eq!(out.stdout, b"echo\0hello\0world\0");
}

#[test]
fn environ_marshaling_matches_wire_format() {
    let wat = r#"
(module
  (import "wasi_snapshot_preview1" "environ_sizes_get" (func $environ_sizes_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "environ_get" (func $environ_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory 1)
  (export "memory" (memory 0))
  (func (export "_start")
    (call $environ_sizes_get (i32.const 0) (i32.const 4)) drop
    (call $environ_get (i32.const 16) (i32.const 512)) drop
    (i32.store (i32.const 8) (i32.const 512))
    (i32.store (i32.const 12) (i32.load (i32.const 4)))
    (call $fd_write (i32.const 1) (i32.const 8) (i32.const 1) (i32.const 0)) drop))
"#;
    let vfs = Vfs::new();
    let out = run_guest(
        wat,
        &vfs,
        &["envdump"],
        &[("PATH", "/bin"), ("HOME", "/home/user")],
        b"",
        1 << 20,
        None,
        CancelToken::new(),
    );
    assert_eq!(out.exit, 0);
    assert_eq!(out.stdout, b"PATH=/bin\0HOME=/home/user\0");
}

#[test]
fn path_open_create_write_lands_in_vfs() {
    let wat = r#"
(module
  (import "wasi_snapshot_preview1" "path_open"
    (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_close" (func $fd_close (param i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory 1)
  (export "memory" (memory 0))
  (data (i32.const 100) "tmp/out.txt")
  (data (i32.const 120) "persisted")
  (func (export "_start")
    (local $fd i32)
    ;; oflags = CREAT | TRUNC, rights = FD_WRITE
    (if (call $path_open (i32.const 3) (i32.const 0) (i32.const 100) (i32.const 11)
          (i32.const 9) (i64.const 64) (i64.const 0) (i32.const 0) (i32.const 0))
      (then (call $proc_exit (i32.const 1))))
    (local.set $fd (i32.load (i32.const 0)))
    (i32.store (i32.const 8) (i32.const 120))
    (i32.store (i32.const 12) (i32.const 9))
    (call $fd_write (local.get $fd) (i32.const 8) (i32.const 1) (i32.const 16)) drop
    (call $fd_close (local.get $fd)) drop))
"#;
    let vfs = Vfs::new();
    let out = run_simple(wat, &vfs);
    assert_eq!(out.exit, 0);
    assert_eq!(vfs.read_file("/tmp/out.txt").unwrap(), b"persisted");
}

#[test]
fn path_open_read_streams_file_contents() {
    let wat = r#"
(module
  (import "wasi_snapshot_preview1" "path_open"
    (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_read" (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory 1)
  (export "memory" (memory 0))
  (data (i32.const 100) "tmp/in.txt")
  (func (export "_start")
    (local $fd i32)
    ;; rights = FD_READ
    (if (call $path_open (i32.const 3) (i32.const 0) (i32.const 100) (i32.const 10)
          (i32.const 0) (i64.const 2) (i64.const 0) (i32.const 0) (i32.const 0))
      (then (call $proc_exit (i32.const 1))))
    (local.set $fd (i32.load (i32.const 0)))
    (i32.store (i32.const 8) (i32.const 1024))
    (i32.store (i32.const 12) (i32.const 256))
    (call $fd_read (local.get $fd) (i32.const 8) (i32.const 1) (i32.const 16)) drop
    (i32.store (i32.const 24) (i32.const 1024))
    (i32.store (i32.const 28) (i32.load (i32.const 16)))
    (call $fd_write (i32.const 1) (i32.const 24) (i32.const 1) (i32.const 32)) drop))
"#;
    let vfs = Vfs::new();
    vfs.write_file("/tmp/in.txt", b"from the vfs").unwrap();
    let out = run_simple(wat, &vfs);
    assert_eq!(out.exit, 0);
    assert_eq!(out.stdout, b"from the vfs");
}

#[test]
fn missing_file_yields_noent_errno() {
    let wat = r#"
(module
  (import "wasi_snapshot_preview1" "path_open"
    (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory 1)
  (export "memory" (memory 0))
  (data (i32.const 100) "nonexistent")
  (func (export "_start")
    (call $proc_exit
      (call $path_open (i32.const 3) (i32.const 0) (i32.const 100) (i32.const 11)
        (i32.const 0) (i64.const 2) (i64.const 0) (i32.const 0) (i32.const 0)))))
"#;
    let vfs = Vfs::new();
    let out = run_simple(wat, &vfs);
    assert_eq!(out.exit, 44); // ERRNO_NOENT
}

#[test]
fn path_create_directory_creates_in_vfs() {
    let wat = r#"
(module
  (import "wasi_snapshot_preview1" "path_create_directory"
    (func $path_create_directory (param i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory 1)
  (export "memory" (memory 0))
  (data (i32.const 100) "tmp/made")
  (func (export "_start")
    (call $proc_exit
      (call $path_create_directory (i32.const 3) (i32.const 100) (i32.const 8)))))
"#;
    let vfs = Vfs::new();
    let out = run_simple(wat, &vfs);
    assert_eq!(out.exit, 0);
    assert!(vfs.stat("/tmp/made").unwrap().is_dir());
}

#[test]
fn prestat_exposes_root_preopen() {
    let wat = r#"
(module
  (import "wasi_snapshot_preview1" "fd_prestat_get" (func $fd_prestat_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_prestat_dir_name" (func $fd_prestat_dir_name (param i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory 1)
  (export "memory" (memory 0))
  (func (export "_start")
    (if (call $fd_prestat_get (i32.const 3) (i32.const 0))
      (then (call $proc_exit (i32.const 1))))
    (if (call $fd_prestat_dir_name (i32.const 3) (i32.const 16) (i32.load (i32.const 4)))
      (then (call $proc_exit (i32.const 2))))
    ;; name must be "/"
    (if (i32.ne (i32.load8_u (i32.const 16)) (i32.const 47))
      (then (call $proc_exit (i32.const 3))))
    ;; fd 4 is not a preopen
    (if (i32.eqz (call $fd_prestat_get (i32.const 4) (i32.const 0)))
      (then (call $proc_exit (i32.const 4))))
    (call $proc_exit (i32.const 0))))
"#;
    let vfs = Vfs::new();
    let out = run_simple(wat, &vfs);
    assert_eq!(out.exit, 0);
}

#[test]
fn random_get_fills_guest_memory() {
    let wat = r#"
(module
  (import "wasi_snapshot_preview1" "random_get" (func $random_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory 1)
  (export "memory" (memory 0))
  (func (export "_start")
    (if (call $random_get (i32.const 64) (i32.const 16))
      (then (call $proc_exit (i32.const 1))))
    (i32.store (i32.const 0) (i32.const 64))
    (i32.store (i32.const 4) (i32.const 16))
    (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)) drop))
"#;
    let vfs = Vfs::new();
    let out = run_simple(wat, &vfs);
    assert_eq!(out.exit, 0);
    assert_eq!(out.stdout.len(), 16);
}

const SPIN: &str = r#"
(module
  (import "wasi_snapshot_preview1" "clock_time_get" (func $clock_time_get (param i32 i64 i32) (result i32)))
  (memory 1)
  (export "memory" (memory 0))
  (func (export "_start")
    (loop $l
      (call $clock_time_get (i32.const 1) (i64.const 0) (i32.const 0)) drop
      (br $l))))
"#;

#[test]
fn deadline_unwinds_syscalling_guest() {
    let vfs = Vfs::new();
    let started = Instant::now();
    let out = run_guest(
        SPIN,
        &vfs,
        &["spin"],
        &[],
        b"",
        1 << 20,
        Some(Duration::from_millis(80)),
        CancelToken::new(),
    );
    assert_eq!(out.interrupt, Some(Interrupt::Timeout));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn cancellation_unwinds_at_next_syscall() {
    let vfs = Vfs::new();
    let cancel = CancelToken::new();
    cancel.cancel();
    let out = run_guest(
        HELLO,
        &vfs,
        &["hello"],
        &[],
        b"",
        1 << 20,
        None,
        cancel,
    );
    assert_eq!(out.interrupt, Some(Interrupt::Cancelled));
    assert_eq!(out.stdout, b"");
}

#[test]
fn stdout_limit_truncates_and_latches() {
    let wat = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory 1)
  (export "memory" (memory 0))
  (data (i32.const 64) "AAAAAAAAAAAAAAAA")
  (func (export "_start")
    (local $i i32)
    (i32.store (i32.const 0) (i32.const 64))
    (i32.store (i32.const 4) (i32.const 16))
    (local.set $i (i32.const 10))
    (loop $l
      (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)) drop
      (local.set $i (i32.sub (local.get $i) (i32.const 1)))
      (br_if $l (i32.gt_s (local.get $i) (i32.const 0))))))
"#;
    let vfs = Vfs::new();
    let out = run_guest(
        wat,
        &vfs,
        &["chatty"],
        &[],
        b"",
        100,
        None,
        CancelToken::new(),
    );
    assert_eq!(out.exit, 0);
    assert_eq!(out.stdout.len(), 100);
    assert!(out.stdout_truncated);
}

#[test]
fn poll_oneoff_clock_subscription_sleeps() {
    // One clock subscription for 30ms; layout per preview-1 witx.
    let wat = r#"
(module
  (import "wasi_snapshot_preview1" "poll_oneoff" (func $poll_oneoff (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory 1)
  (export "memory" (memory 0))
  (func (export "_start")
    ;; subscription at 0: userdata=99 @0, tag=clock @8, timeout 30ms @24
    (i64.store (i32.const 0) (i64.const 99))
    (i32.store8 (i32.const 8) (i32.const 0))
    (i64.store (i32.const 24) (i64.const 30000000))
    (if (call $poll_oneoff (i32.const 0) (i32.const 128) (i32.const 1) (i32.const 96))
      (then (call $proc_exit (i32.const 1))))
    ;; one event expected, userdata preserved
    (if (i32.ne (i32.load (i32.const 96)) (i32.const 1))
      (then (call $proc_exit (i32.const 2))))
    (if (i64.ne (i64.load (i32.const 128)) (i64.const 99))
      (then (call $proc_exit (i32.const 3))))
    (call $proc_exit (i32.const 0))))
"#;
    let vfs = Vfs::new();
    let started = Instant::now();
    let out = run_simple(wat, &vfs);
    assert_eq!(out.exit, 0);
    assert!(started.elapsed() >= Duration::from_millis(25));
}

#[test]
fn trap_in_guest_is_reported_as_runtime_error() {
    let wat = r#"
(module
  (memory 1)
  (export "memory" (memory 0))
  (func (export "_start")
    unreachable))
"#;
    let vfs = Vfs::new();
    let mut store = Store::default();
    let module = Module::new(&store, wat2wasm(wat.as_bytes()).unwrap()).unwrap();
    let wasi = WasiEnv::new(
        Arc::new(vfs),
        vec!["trap".to_string()],
        vec![],
        "/".to_string(),
        Vec::new(),
        1 << 20,
        None,
        CancelToken::new(),
    );
    let env = FunctionEnv::new(&mut store, wasi);
    let imports = build_imports(&mut store, &env);
    let instance = Instance::new(&mut store, &module, &imports).unwrap();
    let memory = instance.exports.get_memory("memory").unwrap().clone();
    env.as_mut(&mut store).memory = Some(memory);
    let start = instance.exports.get_function("_start").unwrap().clone();
    let err = start.call(&mut store, &[]).unwrap_err();
    assert!(err.downcast_ref::<ExitCode>().is_none());
    assert!(err.downcast_ref::<Interrupt>().is_none());
}
