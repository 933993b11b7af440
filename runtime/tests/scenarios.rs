//! End-to-end scenarios.
//!
//! Each guest here is a hand-asyncified module: it exports the asyncify
//! hooks and keeps its progress in a `$pc` global, so after an unwind the
//! driver can re-enter `_start` and the guest fast-forwards to the
//! suspended call site. The observable protocol is the one binaryen's
//! asyncify pass produces, small enough here to audit in a test file.
//!
//! Every filesystem scenario runs twice: once against the immediate
//! in-memory filesystem (calls complete synchronously inside the import)
//! and once with forced-async mode (every host operation yields, so each
//! call takes the full unwind/await/rewind path).

use std::cell::RefCell;
use std::rc::Rc;

use tokio_util::sync::CancellationToken;
use wasmi::Val;

use strand_runtime::streams::{buffer_in, string_out};
use strand_runtime::{run, GuestHandle, Invocation, RuntimeError};
use strand_storage::MemDirectory;

/// Asyncify hook emulation shared by every guest: state global + the five
/// exports, plus a `$pc` stage counter standing in for the saved stack.
const PRELUDE: &str = r#"
  (memory (export "memory") 1)
  (global $state (mut i32) (i32.const 0))
  (global $pc (mut i32) (i32.const 0))
  (func (export "asyncify_get_state") (result i32) (global.get $state))
  (func (export "asyncify_start_unwind") (param i32) (global.set $state (i32.const 1)))
  (func (export "asyncify_stop_unwind") (global.set $state (i32.const 0)))
  (func (export "asyncify_start_rewind") (param i32) (global.set $state (i32.const 2)))
  (func (export "asyncify_stop_rewind") (global.set $state (i32.const 0)))
"#;

fn guest(body: &str) -> Vec<u8> {
    wat::parse_str(format!("(module {} {})", body, PRELUDE)).expect("valid wat")
}

fn capture() -> (Rc<RefCell<String>>, Rc<dyn strand_runtime::streams::OutputStream>) {
    let collected = Rc::new(RefCell::new(String::new()));
    let sink = Rc::clone(&collected);
    let stream = string_out(move |chunk| sink.borrow_mut().push_str(chunk));
    (collected, stream)
}

/// cat: open `input.txt` from the pre-open, copy it to stdout until EOF,
/// close. Exercises path_open, fd_read, fd_write, fd_close and the EOF
/// loop-back.
const CAT_GUEST: &str = r#"
  (import "wasi_snapshot_preview1" "path_open"
    (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_read"
    (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_close"
    (func $fd_close (param i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit"
    (func $proc_exit (param i32)))
  (data (i32.const 1024) "input.txt")
  (func (export "_start")
    (local $e i32)
    (block $done
      (loop $next
        ;; stage 0: open input.txt, fd -> @1060
        (if (i32.eqz (global.get $pc))
          (then
            (local.set $e (call $path_open
              (i32.const 3) (i32.const 0)
              (i32.const 1024) (i32.const 9)
              (i32.const 0) (i64.const -1) (i64.const -1) (i32.const 0)
              (i32.const 1060)))
            (br_if $done (i32.eq (global.get $state) (i32.const 1)))
            (if (local.get $e) (then (call $proc_exit (local.get $e))))
            (global.set $pc (i32.const 1))
            (br $next)))
        ;; stage 1: read a chunk, nread -> @1056
        (if (i32.eq (global.get $pc) (i32.const 1))
          (then
            (i32.store (i32.const 1040) (i32.const 2048))
            (i32.store (i32.const 1044) (i32.const 4096))
            (local.set $e (call $fd_read
              (i32.load (i32.const 1060)) (i32.const 1040) (i32.const 1) (i32.const 1056)))
            (br_if $done (i32.eq (global.get $state) (i32.const 1)))
            (if (local.get $e) (then (call $proc_exit (local.get $e))))
            (if (i32.eqz (i32.load (i32.const 1056)))
              (then (global.set $pc (i32.const 3)))
              (else (global.set $pc (i32.const 2))))
            (br $next)))
        ;; stage 2: write the chunk to stdout, then read again
        (if (i32.eq (global.get $pc) (i32.const 2))
          (then
            (i32.store (i32.const 1040) (i32.const 2048))
            (i32.store (i32.const 1044) (i32.load (i32.const 1056)))
            (local.set $e (call $fd_write
              (i32.const 1) (i32.const 1040) (i32.const 1) (i32.const 1064)))
            (br_if $done (i32.eq (global.get $state) (i32.const 1)))
            (if (local.get $e) (then (call $proc_exit (local.get $e))))
            (global.set $pc (i32.const 1))
            (br $next)))
        ;; stage 3: close
        (local.set $e (call $fd_close (i32.load (i32.const 1060))))
        (br_if $done (i32.eq (global.get $state) (i32.const 1)))
        (if (local.get $e) (then (call $proc_exit (local.get $e))))
      )
    )
  )
"#;

fn sandbox_with_input() -> Rc<MemDirectory> {
    let root = MemDirectory::new();
    root.create_file("input.txt", b"hello from input.txt\n").unwrap();
    root.create_file("input2.txt", b"hello from input2.txt\n").unwrap();
    Rc::new(root)
}

#[tokio::test]
async fn read_file() {
    let root = sandbox_with_input();
    let (out, stream) = capture();
    let status = run(
        &guest(CAT_GUEST),
        Invocation::new()
            .preopen("/sandbox", root)
            .stdout(stream),
    )
    .await
    .unwrap();
    assert_eq!(status, 0);
    assert_eq!(*out.borrow(), "hello from input.txt\n");
}

#[tokio::test]
async fn read_file_with_forced_async_filesystem() {
    let root = sandbox_with_input();
    root.set_forced_async(true);
    let (out, stream) = capture();
    let status = run(
        &guest(CAT_GUEST),
        Invocation::new()
            .preopen("/sandbox", Rc::clone(&root) as Rc<dyn strand_storage::DirHandle>)
            .stdout(stream),
    )
    .await
    .unwrap();
    assert_eq!(status, 0);
    assert_eq!(*out.borrow(), "hello from input.txt\n");
}

/// Like cat, but seeks back to the start and copies the file a second
/// time.
const READ_TWICE_GUEST: &str = r#"
  (import "wasi_snapshot_preview1" "path_open"
    (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_read"
    (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_seek"
    (func $fd_seek (param i32 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_close"
    (func $fd_close (param i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit"
    (func $proc_exit (param i32)))
  (data (i32.const 1024) "input.txt")
  (func (export "_start")
    (local $e i32)
    (block $done
      (loop $next
        (if (i32.eqz (global.get $pc))
          (then
            (local.set $e (call $path_open
              (i32.const 3) (i32.const 0)
              (i32.const 1024) (i32.const 9)
              (i32.const 0) (i64.const -1) (i64.const -1) (i32.const 0)
              (i32.const 1060)))
            (br_if $done (i32.eq (global.get $state) (i32.const 1)))
            (if (local.get $e) (then (call $proc_exit (local.get $e))))
            (global.set $pc (i32.const 1))
            (br $next)))
        ;; stages 1 and 4: read
        (if (i32.or
              (i32.eq (global.get $pc) (i32.const 1))
              (i32.eq (global.get $pc) (i32.const 4)))
          (then
            (i32.store (i32.const 1040) (i32.const 2048))
            (i32.store (i32.const 1044) (i32.const 4096))
            (local.set $e (call $fd_read
              (i32.load (i32.const 1060)) (i32.const 1040) (i32.const 1) (i32.const 1056)))
            (br_if $done (i32.eq (global.get $state) (i32.const 1)))
            (if (local.get $e) (then (call $proc_exit (local.get $e))))
            (global.set $pc (i32.add (global.get $pc) (i32.const 1)))
            (br $next)))
        ;; stages 2 and 5: write
        (if (i32.or
              (i32.eq (global.get $pc) (i32.const 2))
              (i32.eq (global.get $pc) (i32.const 5)))
          (then
            (i32.store (i32.const 1040) (i32.const 2048))
            (i32.store (i32.const 1044) (i32.load (i32.const 1056)))
            (local.set $e (call $fd_write
              (i32.const 1) (i32.const 1040) (i32.const 1) (i32.const 1064)))
            (br_if $done (i32.eq (global.get $state) (i32.const 1)))
            (if (local.get $e) (then (call $proc_exit (local.get $e))))
            (global.set $pc (i32.add (global.get $pc) (i32.const 1)))
            (br $next)))
        ;; stage 3: rewind to offset 0
        (if (i32.eq (global.get $pc) (i32.const 3))
          (then
            (local.set $e (call $fd_seek
              (i32.load (i32.const 1060)) (i64.const 0) (i32.const 0) (i32.const 1072)))
            (br_if $done (i32.eq (global.get $state) (i32.const 1)))
            (if (local.get $e) (then (call $proc_exit (local.get $e))))
            (global.set $pc (i32.const 4))
            (br $next)))
        ;; stage 6: close
        (local.set $e (call $fd_close (i32.load (i32.const 1060))))
        (br_if $done (i32.eq (global.get $state) (i32.const 1)))
        (if (local.get $e) (then (call $proc_exit (local.get $e))))
      )
    )
  )
"#;

#[tokio::test]
async fn read_file_twice() {
    for forced_async in [false, true] {
        let root = sandbox_with_input();
        root.set_forced_async(forced_async);
        let (out, stream) = capture();
        let status = run(
            &guest(READ_TWICE_GUEST),
            Invocation::new()
                .preopen("/sandbox", Rc::clone(&root) as Rc<dyn strand_storage::DirHandle>)
                .stdout(stream),
        )
        .await
        .unwrap();
        assert_eq!(status, 0);
        assert_eq!(
            *out.borrow(),
            "hello from input.txt\nhello from input.txt\n",
            "forced_async={}",
            forced_async
        );
    }
}

/// Echo stdin to stdout once.
const ECHO_GUEST: &str = r#"
  (import "wasi_snapshot_preview1" "fd_read"
    (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit"
    (func $proc_exit (param i32)))
  (func (export "_start")
    (local $e i32)
    (block $done
      (loop $next
        (if (i32.eqz (global.get $pc))
          (then
            (i32.store (i32.const 1040) (i32.const 2048))
            (i32.store (i32.const 1044) (i32.const 4096))
            (local.set $e (call $fd_read
              (i32.const 0) (i32.const 1040) (i32.const 1) (i32.const 1056)))
            (br_if $done (i32.eq (global.get $state) (i32.const 1)))
            (if (local.get $e) (then (call $proc_exit (local.get $e))))
            (global.set $pc (i32.const 1))
            (br $next)))
        (i32.store (i32.const 1040) (i32.const 2048))
        (i32.store (i32.const 1044) (i32.load (i32.const 1056)))
        (local.set $e (call $fd_write
          (i32.const 1) (i32.const 1040) (i32.const 1) (i32.const 1064)))
        (br_if $done (i32.eq (global.get $state) (i32.const 1)))
        (if (local.get $e) (then (call $proc_exit (local.get $e))))
      )
    )
  )
"#;

#[tokio::test]
async fn stdin_echo() {
    let (out, stream) = capture();
    let status = run(
        &guest(ECHO_GUEST),
        Invocation::new()
            .stdin(buffer_in("hello world"))
            .stdout(stream),
    )
    .await
    .unwrap();
    assert_eq!(status, 0);
    assert_eq!(*out.borrow(), "hello world");
}

const EXIT_GUEST: &str = r#"
  (import "wasi_snapshot_preview1" "proc_exit"
    (func $proc_exit (param i32)))
  (func (export "_start")
    (call $proc_exit (i32.const 120)))
"#;

#[tokio::test]
async fn exitcode_is_carried_to_the_driver() {
    let status = run(&guest(EXIT_GUEST), Invocation::new()).await.unwrap();
    assert_eq!(status, 120);
}

/// freopen: open input2.txt, renumber it onto fd 0, then read "stdin".
const FREOPEN_GUEST: &str = r#"
  (import "wasi_snapshot_preview1" "path_open"
    (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_renumber"
    (func $fd_renumber (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_read"
    (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit"
    (func $proc_exit (param i32)))
  (data (i32.const 1024) "input2.txt")
  (func (export "_start")
    (local $e i32)
    (block $done
      (loop $next
        (if (i32.eqz (global.get $pc))
          (then
            (local.set $e (call $path_open
              (i32.const 3) (i32.const 0)
              (i32.const 1024) (i32.const 10)
              (i32.const 0) (i64.const -1) (i64.const -1) (i32.const 0)
              (i32.const 1060)))
            (br_if $done (i32.eq (global.get $state) (i32.const 1)))
            (if (local.get $e) (then (call $proc_exit (local.get $e))))
            (global.set $pc (i32.const 1))
            (br $next)))
        (if (i32.eq (global.get $pc) (i32.const 1))
          (then
            (local.set $e (call $fd_renumber
              (i32.load (i32.const 1060)) (i32.const 0)))
            (br_if $done (i32.eq (global.get $state) (i32.const 1)))
            (if (local.get $e) (then (call $proc_exit (local.get $e))))
            (global.set $pc (i32.const 2))
            (br $next)))
        (if (i32.eq (global.get $pc) (i32.const 2))
          (then
            (i32.store (i32.const 1040) (i32.const 2048))
            (i32.store (i32.const 1044) (i32.const 4096))
            (local.set $e (call $fd_read
              (i32.const 0) (i32.const 1040) (i32.const 1) (i32.const 1056)))
            (br_if $done (i32.eq (global.get $state) (i32.const 1)))
            (if (local.get $e) (then (call $proc_exit (local.get $e))))
            (global.set $pc (i32.const 3))
            (br $next)))
        (i32.store (i32.const 1040) (i32.const 2048))
        (i32.store (i32.const 1044) (i32.load (i32.const 1056)))
        (local.set $e (call $fd_write
          (i32.const 1) (i32.const 1040) (i32.const 1) (i32.const 1064)))
        (br_if $done (i32.eq (global.get $state) (i32.const 1)))
        (if (local.get $e) (then (call $proc_exit (local.get $e))))
      )
    )
  )
"#;

#[tokio::test]
async fn freopen_redirects_fd_zero() {
    for forced_async in [false, true] {
        let root = sandbox_with_input();
        root.set_forced_async(forced_async);
        let (out, stream) = capture();
        let status = run(
            &guest(FREOPEN_GUEST),
            Invocation::new()
                .preopen("/sandbox", Rc::clone(&root) as Rc<dyn strand_storage::DirHandle>)
                .stdin(buffer_in("NOT THIS"))
                .stdout(stream),
        )
        .await
        .unwrap();
        assert_eq!(status, 0);
        assert_eq!(*out.borrow(), "hello from input2.txt\n");
    }
}

/// Two separate writes; the output stream sees two chunks.
const FLUSH_GUEST: &str = r#"
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit"
    (func $proc_exit (param i32)))
  (data (i32.const 1100) "1234")
  (func (export "_start")
    (local $e i32)
    (block $done
      (loop $next
        (if (i32.eqz (global.get $pc))
          (then
            (i32.store (i32.const 1040) (i32.const 1100))
            (i32.store (i32.const 1044) (i32.const 2))
            (local.set $e (call $fd_write
              (i32.const 1) (i32.const 1040) (i32.const 1) (i32.const 1064)))
            (br_if $done (i32.eq (global.get $state) (i32.const 1)))
            (if (local.get $e) (then (call $proc_exit (local.get $e))))
            (global.set $pc (i32.const 1))
            (br $next)))
        (i32.store (i32.const 1040) (i32.const 1102))
        (i32.store (i32.const 1044) (i32.const 2))
        (local.set $e (call $fd_write
          (i32.const 1) (i32.const 1040) (i32.const 1) (i32.const 1064)))
        (br_if $done (i32.eq (global.get $state) (i32.const 1)))
        (if (local.get $e) (then (call $proc_exit (local.get $e))))
      )
    )
  )
"#;

#[tokio::test]
async fn stdout_chunks_preserve_flush_boundaries() {
    let chunks = Rc::new(RefCell::new(Vec::<String>::new()));
    let sink = Rc::clone(&chunks);
    let stream = string_out(move |chunk| sink.borrow_mut().push(chunk.to_string()));
    let status = run(&guest(FLUSH_GUEST), Invocation::new().stdout(stream))
        .await
        .unwrap();
    assert_eq!(status, 0);
    assert_eq!(*chunks.borrow(), ["12", "34"]);
    assert_eq!(chunks.borrow().join("\n"), "12\n34");
}

/// Pure-compute exports for export mode; no WASI imports at all.
const MATH_GUEST: &str = r#"
  (func (export "sum") (param i32 i32) (result i32)
    (i32.add (local.get 0) (local.get 1)))
  (func (export "div") (param f64 f64) (result f64)
    (f64.div (local.get 0) (local.get 1)))
"#;

#[tokio::test]
async fn export_mode_calls_arbitrary_functions() {
    let mut guest_handle = GuestHandle::instantiate(&guest(MATH_GUEST), Invocation::new()).unwrap();

    let results = guest_handle
        .invoke("sum", &[Val::I32(1), Val::I32(1)])
        .await
        .unwrap();
    assert!(matches!(results[..], [Val::I32(2)]));

    let results = guest_handle
        .invoke("div", &[Val::F64(10.0.into()), Val::F64(3.0.into())])
        .await
        .unwrap();
    let quotient = match &results[..] {
        [Val::F64(v)] => f64::from(*v),
        other => panic!("unexpected results: {:?}", other),
    };
    assert!((quotient - 10.0 / 3.0).abs() < 1e-12);

    let results = guest_handle
        .invoke("div", &[Val::F64(1.0.into()), Val::F64(0.0.into())])
        .await
        .unwrap();
    let inf = match &results[..] {
        [Val::F64(v)] => f64::from(*v),
        other => panic!("unexpected results: {:?}", other),
    };
    assert_eq!(inf, f64::INFINITY);

    let results = guest_handle
        .invoke("div", &[Val::F64(0.0.into()), Val::F64(0.0.into())])
        .await
        .unwrap();
    let nan = match &results[..] {
        [Val::F64(v)] => f64::from(*v),
        other => panic!("unexpected results: {:?}", other),
    };
    assert!(nan.is_nan());

    let err = guest_handle.invoke("missing", &[]).await.unwrap_err();
    assert!(matches!(err, RuntimeError::MissingExport(_)));
}

/// One clock subscription; checks the event that comes back.
fn poll_guest(timeout_ns: u64) -> Vec<u8> {
    let body = format!(
        r#"
  (import "wasi_snapshot_preview1" "poll_oneoff"
    (func $poll_oneoff (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit"
    (func $proc_exit (param i32)))
  (func (export "_start")
    (local $e i32)
    (block $done
      ;; subscription @1200: userdata=7, clock, monotonic, relative
      (i64.store (i32.const 1200) (i64.const 7))
      (i32.store8 (i32.const 1208) (i32.const 0))
      (i32.store (i32.const 1216) (i32.const 1))
      (i64.store (i32.const 1224) (i64.const {timeout_ns}))
      (i64.store (i32.const 1232) (i64.const 0))
      (i32.store16 (i32.const 1240) (i32.const 0))
      (local.set $e (call $poll_oneoff
        (i32.const 1200) (i32.const 1300) (i32.const 1) (i32.const 1400)))
      (br_if $done (i32.eq (global.get $state) (i32.const 1)))
      (if (local.get $e) (then (call $proc_exit (local.get $e))))
      (if (i32.ne (i32.load (i32.const 1400)) (i32.const 1))
        (then (call $proc_exit (i32.const 101))))
      (if (i64.ne (i64.load (i32.const 1300)) (i64.const 7))
        (then (call $proc_exit (i32.const 102))))
      (if (i32.ne (i32.load16_u (i32.const 1308)) (i32.const 0))
        (then (call $proc_exit (i32.const 103))))
    )
  )
"#
    );
    guest(&body)
}

#[tokio::test]
async fn poll_oneoff_sleeps_and_fires_the_clock_event() {
    let started = std::time::Instant::now();
    let status = run(&poll_guest(20_000_000), Invocation::new())
        .await
        .unwrap();
    assert_eq!(status, 0);
    assert!(started.elapsed().as_millis() >= 20);
}

#[tokio::test]
async fn aborting_a_clock_wait_yields_canceled() {
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        canceller.cancel();
    });
    // 60s timeout: without cancellation this test would hang far past its
    // deadline.
    let status = run(
        &poll_guest(60_000_000_000),
        Invocation::new().cancel_token(token),
    )
    .await
    .unwrap();
    // CANCELED surfaces to the guest, which exits with it.
    assert_eq!(status, 11);
}

#[tokio::test]
async fn modules_without_asyncify_hooks_are_rejected() {
    let wasm = wat::parse_str(r#"(module (memory (export "memory") 1) (func (export "_start")))"#)
        .unwrap();
    let err = GuestHandle::instantiate(&wasm, Invocation::new()).unwrap_err();
    assert!(matches!(err, RuntimeError::MissingExport(_)));
}

/// A guest that exits without closing its written file; the driver's final
/// flush must still commit the data.
const WRITE_EXIT_GUEST: &str = r#"
  (import "wasi_snapshot_preview1" "path_open"
    (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit"
    (func $proc_exit (param i32)))
  (data (i32.const 1024) "out.txt")
  (data (i32.const 1100) "persisted")
  (func (export "_start")
    (local $e i32)
    (block $done
      (loop $next
        (if (i32.eqz (global.get $pc))
          (then
            ;; oflags CREAT = 1
            (local.set $e (call $path_open
              (i32.const 3) (i32.const 0)
              (i32.const 1024) (i32.const 7)
              (i32.const 1) (i64.const -1) (i64.const -1) (i32.const 0)
              (i32.const 1060)))
            (br_if $done (i32.eq (global.get $state) (i32.const 1)))
            (if (local.get $e) (then (call $proc_exit (local.get $e))))
            (global.set $pc (i32.const 1))
            (br $next)))
        (i32.store (i32.const 1040) (i32.const 1100))
        (i32.store (i32.const 1044) (i32.const 9))
        (local.set $e (call $fd_write
          (i32.load (i32.const 1060)) (i32.const 1040) (i32.const 1) (i32.const 1064)))
        (br_if $done (i32.eq (global.get $state) (i32.const 1)))
        (if (local.get $e) (then (call $proc_exit (local.get $e))))
        (call $proc_exit (i32.const 7))
      )
    )
  )
"#;

#[tokio::test]
async fn dirty_files_are_flushed_after_exit() {
    for forced_async in [false, true] {
        let root = Rc::new(MemDirectory::new());
        root.set_forced_async(forced_async);
        let status = run(
            &guest(WRITE_EXIT_GUEST),
            Invocation::new()
                .preopen("/sandbox", Rc::clone(&root) as Rc<dyn strand_storage::DirHandle>),
        )
        .await
        .unwrap();
        assert_eq!(status, 7);
        assert_eq!(root.read("out.txt").unwrap(), b"persisted");
    }
}
