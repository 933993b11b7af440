//! `wasi_snapshot_preview1` binding surface.
//!
//! Every function reads its arguments out of guest memory, talks to the fd
//! table, the std streams or the host filesystem, writes results back into
//! guest memory, and returns a WASI errno. Host work that cannot finish
//! immediately is expressed as a [`Flow::Suspend`]; the asyncify controller
//! takes it from there.

use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use wasmi::{Caller, Linker};

use strand_storage::{DirHandle, EntryKind, FileHandle, FsError, Node, NodeKind, OpenFlags};

use crate::abi::{
    ClockFlags, ClockId, Dirent, Errno, Event, EventKind, FdFlags, Fdstat, Filestat, Filetype,
    Iovec, Layout, OFlags, Prestat, Rights, Subscription, SubscriptionContent, Whence,
};
use crate::asyncify::{self, resume_with, CallError, Flow, GuestCall, HostState};
use crate::fd::{resolve_path, EntryIter, FdEntry, FdTable, OpenDirectory, OpenFile, PreOpen};
use crate::memory::GuestMemory;
use crate::streams::{InputStream, OutputStream};
use crate::{ExitStatus, RuntimeError};

const PREVIEW1: &str = "wasi_snapshot_preview1";

// ─── Invocation state ──────────────────────────────────────────────

/// Packed argv/environ layout shared by `args_get` and `environ_get`: a
/// NUL-separated buffer plus a table of absolute pointers into it.
#[derive(Debug)]
pub struct StringCollection {
    entries: Vec<Vec<u8>>,
}

impl StringCollection {
    pub fn new(items: Vec<String>) -> Result<Self, RuntimeError> {
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            if item.as_bytes().contains(&0) {
                return Err(RuntimeError::Instantiation(format!(
                    "string contains an interior NUL byte: {:?}",
                    item
                )));
            }
            entries.push(item.into_bytes());
        }
        Ok(StringCollection { entries })
    }

    pub fn count(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Total packed size, one NUL terminator per entry included.
    pub fn buffer_size(&self) -> u32 {
        self.entries.iter().map(|e| e.len() as u32 + 1).sum()
    }

    /// Write the pointer table at `offsets_ptr` (absolute pointers into the
    /// packed buffer) and the NUL-terminated strings at `buf_ptr`.
    pub fn write(
        &self,
        mem: &mut GuestMemory<'_>,
        offsets_ptr: u32,
        buf_ptr: u32,
    ) -> Result<(), Errno> {
        let mut at = buf_ptr;
        for (i, entry) in self.entries.iter().enumerate() {
            mem.write_u32(offsets_ptr + i as u32 * 4, at)?;
            mem.write_bytes(at, entry)?;
            mem.write_u8(at + entry.len() as u32, 0)?;
            at += entry.len() as u32 + 1;
        }
        Ok(())
    }
}

/// Per-invocation WASI state: fd table, argv/environ, std streams, clock
/// origin and the abort token.
pub struct WasiCtx {
    pub fds: FdTable,
    args: StringCollection,
    env: StringCollection,
    stdin: Rc<dyn InputStream>,
    stdout: Rc<dyn OutputStream>,
    stderr: Rc<dyn OutputStream>,
    started: Instant,
    cancel: CancellationToken,
}

impl WasiCtx {
    pub fn new(
        args: Vec<String>,
        env: Vec<(String, String)>,
        stdin: Rc<dyn InputStream>,
        stdout: Rc<dyn OutputStream>,
        stderr: Rc<dyn OutputStream>,
        cancel: CancellationToken,
    ) -> Result<Self, RuntimeError> {
        let env = env
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        Ok(WasiCtx {
            fds: FdTable::new(),
            args: StringCollection::new(args)?,
            env: StringCollection::new(env)?,
            stdin,
            stdout,
            stderr,
            started: Instant::now(),
            cancel,
        })
    }

    /// Register a mount; pre-opens are immutable once the guest starts.
    pub fn push_preopen(&mut self, guest_path: impl Into<String>, handle: Rc<dyn DirHandle>) {
        self.fds.push_preopen(PreOpen {
            guest_path: guest_path.into(),
            handle,
        });
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn clock_ns(&self, id: ClockId) -> u64 {
        match id {
            ClockId::Realtime => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
            ClockId::Monotonic => self.started.elapsed().as_nanos() as u64,
        }
    }

    fn stdin_stream(&self) -> Rc<dyn InputStream> {
        Rc::clone(&self.stdin)
    }

    fn out_stream(&self, fd: u32) -> Option<Rc<dyn OutputStream>> {
        match fd {
            1 => Some(Rc::clone(&self.stdout)),
            2 => Some(Rc::clone(&self.stderr)),
            _ => None,
        }
    }
}

// ─── Registration ──────────────────────────────────────────────────

macro_rules! wasi_fn {
    ($linker:expr, $name:ident ( $( $arg:ident : $ty:ty ),* ) => $body:path) => {
        $linker.func_wrap(
            PREVIEW1,
            stringify!($name),
            |mut caller: Caller<'_, HostState>, $( $arg: $ty ),*| -> Result<i32, wasmi::Error> {
                asyncify::trampoline(&mut caller, stringify!($name), |call| {
                    $body(call $(, $arg as _)*)
                })
            },
        )?;
    };
}

/// Define the whole preview1 surface on `linker`.
pub fn add_to_linker(linker: &mut Linker<HostState>) -> Result<(), wasmi::Error> {
    wasi_fn!(linker, args_get(argv: i32, argv_buf: i32) => sys_args_get);
    wasi_fn!(linker, args_sizes_get(count: i32, size: i32) => sys_args_sizes_get);
    wasi_fn!(linker, environ_get(environ: i32, environ_buf: i32) => sys_environ_get);
    wasi_fn!(linker, environ_sizes_get(count: i32, size: i32) => sys_environ_sizes_get);
    wasi_fn!(linker, clock_res_get(id: i32, resolution: i32) => sys_clock_res_get);
    wasi_fn!(linker, clock_time_get(id: i32, precision: i64, time: i32) => sys_clock_time_get);
    wasi_fn!(linker, fd_close(fd: i32) => sys_fd_close);
    wasi_fn!(linker, fd_datasync(fd: i32) => sys_fd_sync);
    wasi_fn!(linker, fd_fdstat_get(fd: i32, stat: i32) => sys_fd_fdstat_get);
    wasi_fn!(linker, fd_fdstat_set_flags(fd: i32, flags: i32) => sys_fd_fdstat_set_flags);
    wasi_fn!(linker, fd_filestat_get(fd: i32, stat: i32) => sys_fd_filestat_get);
    wasi_fn!(linker, fd_filestat_set_size(fd: i32, size: i64) => sys_fd_filestat_set_size);
    wasi_fn!(linker, fd_prestat_get(fd: i32, prestat: i32) => sys_fd_prestat_get);
    wasi_fn!(linker, fd_prestat_dir_name(fd: i32, path: i32, path_len: i32) => sys_fd_prestat_dir_name);
    wasi_fn!(linker, fd_read(fd: i32, iovs: i32, iovs_len: i32, nread: i32) => sys_fd_read);
    wasi_fn!(linker, fd_readdir(fd: i32, buf: i32, buf_len: i32, cookie: i64, used: i32) => sys_fd_readdir);
    wasi_fn!(linker, fd_renumber(from: i32, to: i32) => sys_fd_renumber);
    wasi_fn!(linker, fd_seek(fd: i32, offset: i64, whence: i32, new_offset: i32) => sys_fd_seek);
    wasi_fn!(linker, fd_sync(fd: i32) => sys_fd_sync);
    wasi_fn!(linker, fd_tell(fd: i32, offset: i32) => sys_fd_tell);
    wasi_fn!(linker, fd_write(fd: i32, iovs: i32, iovs_len: i32, nwritten: i32) => sys_fd_write);
    wasi_fn!(linker, path_create_directory(fd: i32, path: i32, path_len: i32) => sys_path_create_directory);
    wasi_fn!(linker, path_filestat_get(fd: i32, flags: i32, path: i32, path_len: i32, stat: i32) => sys_path_filestat_get);
    wasi_fn!(linker, path_filestat_set_times(fd: i32, flags: i32, path: i32, path_len: i32, atim: i64, mtim: i64, fst_flags: i32) => sys_path_filestat_set_times);
    wasi_fn!(linker, path_link(old_fd: i32, old_flags: i32, old_path: i32, old_len: i32, new_fd: i32, new_path: i32, new_len: i32) => sys_path_link);
    wasi_fn!(linker, path_open(fd: i32, dirflags: i32, path: i32, path_len: i32, oflags: i32, rights_base: i64, rights_inheriting: i64, fdflags: i32, opened: i32) => sys_path_open);
    wasi_fn!(linker, path_readlink(fd: i32, path: i32, path_len: i32, buf: i32, buf_len: i32, used: i32) => sys_path_readlink);
    wasi_fn!(linker, path_remove_directory(fd: i32, path: i32, path_len: i32) => sys_path_remove_directory);
    wasi_fn!(linker, path_rename(old_fd: i32, old_path: i32, old_len: i32, new_fd: i32, new_path: i32, new_len: i32) => sys_path_rename);
    wasi_fn!(linker, path_symlink(old_path: i32, old_len: i32, fd: i32, new_path: i32, new_len: i32) => sys_path_symlink);
    wasi_fn!(linker, path_unlink_file(fd: i32, path: i32, path_len: i32) => sys_path_unlink_file);
    wasi_fn!(linker, poll_oneoff(subs: i32, events: i32, nsubs: i32, used: i32) => sys_poll_oneoff);
    wasi_fn!(linker, random_get(buf: i32, len: i32) => sys_random_get);

    // proc_exit never returns to the guest; it tears the whole call stack
    // down as a host error that only the driver catches.
    linker.func_wrap(
        PREVIEW1,
        "proc_exit",
        |_caller: Caller<'_, HostState>, code: i32| -> Result<(), wasmi::Error> {
            log::debug!("proc_exit({})", code);
            Err(wasmi::Error::host(ExitStatus(code as u32)))
        },
    )?;
    Ok(())
}

// ─── Shared helpers ────────────────────────────────────────────────

/// Host filesystem errors become WASI errnos; anything unrecognised aborts
/// the invocation.
fn map_fs(err: FsError) -> CallError {
    match err {
        FsError::NotFound => CallError::Sys(Errno::Noent),
        FsError::PermissionDenied => CallError::Sys(Errno::Acces),
        FsError::InvalidModification => CallError::Sys(Errno::Notempty),
        FsError::Exists => CallError::Sys(Errno::Exist),
        FsError::Aborted => CallError::Sys(Errno::Canceled),
        FsError::InvalidArgument => CallError::Sys(Errno::Inval),
        FsError::Other(msg) => CallError::Fault(format!("host filesystem: {}", msg)),
    }
}

fn read_iovecs(mem: &GuestMemory<'_>, iovs: u32, iovs_len: u32) -> Result<Vec<Iovec>, CallError> {
    let mut out = Vec::with_capacity(iovs_len as usize);
    for i in 0..iovs_len {
        out.push(Iovec::read(mem, iovs + i * Iovec::SIZE)?);
    }
    Ok(out)
}

fn not_loaded() -> CallError {
    CallError::Fault("file cache not loaded".into())
}

/// Replace a file's host contents with `contents`.
async fn write_back(handle: &dyn FileHandle, contents: &[u8]) -> Result<(), CallError> {
    let mut writer = handle.writer(false).await.map_err(map_fs)?;
    writer.write(contents).await.map_err(map_fs)?;
    writer.close().await.map_err(map_fs)?;
    Ok(())
}

fn file_filestat(size: u64, modified_ms: u64) -> Filestat {
    let time_ns = modified_ms * 1_000_000;
    Filestat {
        filetype: Filetype::RegularFile as u8,
        size,
        atim: time_ns,
        mtim: time_ns,
        ctim: time_ns,
        ..Filestat::default()
    }
}

fn write_events(
    mem: &mut GuestMemory<'_>,
    events_ptr: u32,
    used_ptr: u32,
    events: &[Event],
) -> Result<(), CallError> {
    for (i, event) in events.iter().enumerate() {
        event.write(mem, events_ptr + i as u32 * Event::SIZE)?;
    }
    mem.write_u32(used_ptr, events.len() as u32)?;
    Ok(())
}

// ─── args / environ ────────────────────────────────────────────────

fn sys_args_get(call: &mut GuestCall<'_>, argv: u32, argv_buf: u32) -> Result<Flow, CallError> {
    call.ctx.args.write(&mut call.mem, argv, argv_buf)?;
    Ok(Flow::Done)
}

fn sys_args_sizes_get(
    call: &mut GuestCall<'_>,
    count_ptr: u32,
    size_ptr: u32,
) -> Result<Flow, CallError> {
    call.mem.write_u32(count_ptr, call.ctx.args.count())?;
    call.mem.write_u32(size_ptr, call.ctx.args.buffer_size())?;
    Ok(Flow::Done)
}

fn sys_environ_get(
    call: &mut GuestCall<'_>,
    environ: u32,
    environ_buf: u32,
) -> Result<Flow, CallError> {
    call.ctx.env.write(&mut call.mem, environ, environ_buf)?;
    Ok(Flow::Done)
}

fn sys_environ_sizes_get(
    call: &mut GuestCall<'_>,
    count_ptr: u32,
    size_ptr: u32,
) -> Result<Flow, CallError> {
    call.mem.write_u32(count_ptr, call.ctx.env.count())?;
    call.mem.write_u32(size_ptr, call.ctx.env.buffer_size())?;
    Ok(Flow::Done)
}

// ─── clocks / random ───────────────────────────────────────────────

fn sys_clock_res_get(call: &mut GuestCall<'_>, id: u32, out: u32) -> Result<Flow, CallError> {
    ClockId::from_raw(id).ok_or(Errno::Inval)?;
    // 1ms: the host timer has no better guarantee to offer.
    call.mem.write_u64(out, 1_000_000)?;
    Ok(Flow::Done)
}

fn sys_clock_time_get(
    call: &mut GuestCall<'_>,
    id: u32,
    _precision: u64,
    out: u32,
) -> Result<Flow, CallError> {
    let id = ClockId::from_raw(id).ok_or(Errno::Inval)?;
    let now = call.ctx.clock_ns(id);
    call.mem.write_u64(out, now)?;
    Ok(Flow::Done)
}

fn sys_random_get(call: &mut GuestCall<'_>, buf: u32, len: u32) -> Result<Flow, CallError> {
    let dst = call.mem.bytes_mut(buf, len)?;
    OsRng.fill_bytes(dst);
    Ok(Flow::Done)
}

// ─── pre-opens ─────────────────────────────────────────────────────

fn sys_fd_prestat_get(call: &mut GuestCall<'_>, fd: u32, out: u32) -> Result<Flow, CallError> {
    let name_len = call.ctx.fds.get_preopen(fd)?.guest_path.len() as u32;
    Prestat { name_len }.write(&mut call.mem, out)?;
    Ok(Flow::Done)
}

fn sys_fd_prestat_dir_name(
    call: &mut GuestCall<'_>,
    fd: u32,
    path: u32,
    path_len: u32,
) -> Result<Flow, CallError> {
    let name = call.ctx.fds.get_preopen(fd)?.guest_path.clone();
    if name.len() as u32 > path_len {
        return Err(Errno::Inval.into());
    }
    call.mem.write_bytes(path, name.as_bytes())?;
    Ok(Flow::Done)
}

// ─── fd lifecycle ──────────────────────────────────────────────────

fn sys_fd_fdstat_get(call: &mut GuestCall<'_>, fd: u32, out: u32) -> Result<Flow, CallError> {
    let filetype = match call.ctx.fds.get(fd) {
        Ok(FdEntry::File(_)) => Filetype::RegularFile,
        Ok(FdEntry::Dir(_)) | Ok(FdEntry::PreOpen(_)) => Filetype::Directory,
        Err(_) if fd <= 2 => Filetype::CharacterDevice,
        Err(err) => return Err(err.into()),
    };
    Fdstat {
        filetype,
        flags: FdFlags::empty(),
        rights_base: Rights::all(),
        rights_inheriting: Rights::all() - Rights::PATH_SYMLINK,
    }
    .write(&mut call.mem, out)?;
    Ok(Flow::Done)
}

fn sys_fd_fdstat_set_flags(
    _call: &mut GuestCall<'_>,
    _fd: u32,
    _flags: u32,
) -> Result<Flow, CallError> {
    Err(Errno::Nosys.into())
}

fn sys_fd_close(call: &mut GuestCall<'_>, fd: u32) -> Result<Flow, CallError> {
    let flush = match call.ctx.fds.get(fd) {
        Err(_) if fd <= 2 => return Ok(Flow::Done),
        Err(err) => return Err(err.into()),
        Ok(FdEntry::File(file)) if file.is_dirty() => Some((
            Rc::clone(&file.handle),
            file.contents().map(<[u8]>::to_vec).unwrap_or_default(),
        )),
        Ok(_) => None,
    };
    match flush {
        None => {
            call.ctx.fds.remove(fd);
            Ok(Flow::Done)
        }
        Some((handle, contents)) => Ok(Flow::suspend(async move {
            write_back(handle.as_ref(), &contents).await?;
            Ok(resume_with(move |call: &mut GuestCall<'_>| {
                call.ctx.fds.remove(fd);
                Ok(Flow::Done)
            }))
        })),
    }
}

fn sys_fd_renumber(call: &mut GuestCall<'_>, from: u32, to: u32) -> Result<Flow, CallError> {
    call.ctx.fds.get(from)?;
    if from == to {
        return Ok(Flow::Done);
    }
    // Close whatever occupies the target first.
    let flush = match call.ctx.fds.get(to) {
        Ok(FdEntry::File(file)) if file.is_dirty() => Some((
            Rc::clone(&file.handle),
            file.contents().map(<[u8]>::to_vec).unwrap_or_default(),
        )),
        _ => None,
    };
    match flush {
        None => {
            call.ctx.fds.remove(to);
            call.ctx.fds.renumber(from, to)?;
            Ok(Flow::Done)
        }
        Some((handle, contents)) => Ok(Flow::suspend(async move {
            write_back(handle.as_ref(), &contents).await?;
            Ok(resume_with(move |call: &mut GuestCall<'_>| {
                call.ctx.fds.remove(to);
                call.ctx.fds.renumber(from, to)?;
                Ok(Flow::Done)
            }))
        })),
    }
}

// ─── read / write ──────────────────────────────────────────────────

enum ReadTarget {
    Stdin,
    Loaded,
    Unloaded(Rc<dyn FileHandle>),
}

fn sys_fd_read(
    call: &mut GuestCall<'_>,
    fd: u32,
    iovs: u32,
    iovs_len: u32,
    nread_ptr: u32,
) -> Result<Flow, CallError> {
    let iovecs = read_iovecs(&call.mem, iovs, iovs_len)?;
    let target = match call.ctx.fds.get(fd) {
        Ok(FdEntry::File(file)) => {
            if file.is_loaded() {
                ReadTarget::Loaded
            } else {
                ReadTarget::Unloaded(Rc::clone(&file.handle))
            }
        }
        Ok(FdEntry::Dir(_)) | Ok(FdEntry::PreOpen(_)) => return Err(Errno::Isdir.into()),
        Err(_) if fd == 0 => ReadTarget::Stdin,
        Err(err) => return Err(err.into()),
    };
    match target {
        ReadTarget::Loaded => {
            read_file_iovecs(call, fd, &iovecs, nread_ptr)?;
            Ok(Flow::Done)
        }
        ReadTarget::Unloaded(handle) => Ok(Flow::suspend(async move {
            let snapshot = handle.snapshot().await.map_err(map_fs)?;
            Ok(resume_with(move |call: &mut GuestCall<'_>| {
                call.ctx.fds.get_file_mut(fd)?.install(snapshot);
                read_file_iovecs(call, fd, &iovecs, nread_ptr)?;
                Ok(Flow::Done)
            }))
        })),
        ReadTarget::Stdin => {
            let stdin = call.ctx.stdin_stream();
            let cancel = call.ctx.cancel_token();
            Ok(Flow::suspend(async move {
                let mut chunks: Vec<Vec<u8>> = Vec::with_capacity(iovecs.len());
                for iov in &iovecs {
                    if cancel.is_cancelled() {
                        return Err(Errno::Canceled.into());
                    }
                    let chunk = stdin.read(iov.len as usize).await?;
                    let short = (chunk.len() as u32) < iov.len;
                    chunks.push(chunk);
                    if short {
                        break;
                    }
                }
                Ok(resume_with(move |call: &mut GuestCall<'_>| {
                    let mut total: u32 = 0;
                    for (iov, chunk) in iovecs.iter().zip(&chunks) {
                        call.mem.write_bytes(iov.buf, chunk)?;
                        total += chunk.len() as u32;
                    }
                    call.mem.write_u32(nread_ptr, total)?;
                    Ok(Flow::Done)
                }))
            }))
        }
    }
}

/// Serve io-vectors from the contents cache, stopping at the first short
/// read.
fn read_file_iovecs(
    call: &mut GuestCall<'_>,
    fd: u32,
    iovecs: &[Iovec],
    nread_ptr: u32,
) -> Result<(), CallError> {
    let cancel = call.ctx.cancel_token();
    let mut total: u32 = 0;
    for iov in iovecs {
        if cancel.is_cancelled() {
            return Err(Errno::Canceled.into());
        }
        let file = call.ctx.fds.get_file_mut(fd)?;
        let position = file.position as usize;
        let (chunk, take) = {
            let contents = file.contents().ok_or_else(not_loaded)?;
            // The position may sit past EOF after a seek; that reads as
            // empty, not out of bounds.
            let start = position.min(contents.len());
            let take = (contents.len() - start).min(iov.len as usize);
            (contents[start..start + take].to_vec(), take)
        };
        file.position += take as u64;
        call.mem.write_bytes(iov.buf, &chunk)?;
        total += take as u32;
        if take < iov.len as usize {
            break;
        }
    }
    call.mem.write_u32(nread_ptr, total)?;
    Ok(())
}

enum WriteTarget {
    Stream(Rc<dyn OutputStream>),
    Loaded,
    Unloaded(Rc<dyn FileHandle>),
}

fn sys_fd_write(
    call: &mut GuestCall<'_>,
    fd: u32,
    iovs: u32,
    iovs_len: u32,
    nwritten_ptr: u32,
) -> Result<Flow, CallError> {
    let iovecs = read_iovecs(&call.mem, iovs, iovs_len)?;
    let mut data: Vec<Vec<u8>> = Vec::with_capacity(iovecs.len());
    for iov in &iovecs {
        data.push(call.mem.read_bytes(iov.buf, iov.len)?.to_vec());
    }
    let target = match call.ctx.fds.get(fd) {
        Ok(FdEntry::File(file)) => {
            if file.is_loaded() {
                WriteTarget::Loaded
            } else {
                WriteTarget::Unloaded(Rc::clone(&file.handle))
            }
        }
        Ok(FdEntry::Dir(_)) | Ok(FdEntry::PreOpen(_)) => return Err(Errno::Isdir.into()),
        Err(_) => match call.ctx.out_stream(fd) {
            Some(stream) => WriteTarget::Stream(stream),
            None => return Err(Errno::Badf.into()),
        },
    };
    match target {
        WriteTarget::Stream(stream) => {
            let cancel = call.ctx.cancel_token();
            Ok(Flow::suspend(async move {
                let mut total: u32 = 0;
                for chunk in &data {
                    if cancel.is_cancelled() {
                        return Err(Errno::Canceled.into());
                    }
                    stream.write(chunk).await?;
                    total += chunk.len() as u32;
                }
                Ok(resume_with(move |call: &mut GuestCall<'_>| {
                    call.mem.write_u32(nwritten_ptr, total)?;
                    Ok(Flow::Done)
                }))
            }))
        }
        WriteTarget::Loaded => {
            write_file_iovecs(call, fd, &data, nwritten_ptr)?;
            Ok(Flow::Done)
        }
        WriteTarget::Unloaded(handle) => Ok(Flow::suspend(async move {
            let snapshot = handle.snapshot().await.map_err(map_fs)?;
            Ok(resume_with(move |call: &mut GuestCall<'_>| {
                call.ctx.fds.get_file_mut(fd)?.install(snapshot);
                write_file_iovecs(call, fd, &data, nwritten_ptr)?;
                Ok(Flow::Done)
            }))
        })),
    }
}

/// Apply io-vector writes to the contents cache at the current position;
/// writes past end extend the file.
fn write_file_iovecs(
    call: &mut GuestCall<'_>,
    fd: u32,
    data: &[Vec<u8>],
    nwritten_ptr: u32,
) -> Result<(), CallError> {
    let cancel = call.ctx.cancel_token();
    let mut total: u32 = 0;
    for chunk in data {
        if cancel.is_cancelled() {
            return Err(Errno::Canceled.into());
        }
        let file = call.ctx.fds.get_file_mut(fd)?;
        let at = file.position as usize;
        {
            let contents = file.contents_mut().ok_or_else(not_loaded)?;
            if at + chunk.len() > contents.len() {
                contents.resize(at + chunk.len(), 0);
            }
            contents[at..at + chunk.len()].copy_from_slice(chunk);
        }
        file.position += chunk.len() as u64;
        file.touch();
        total += chunk.len() as u32;
    }
    call.mem.write_u32(nwritten_ptr, total)?;
    Ok(())
}

// ─── seek / tell / stat / sync ─────────────────────────────────────

fn sys_fd_seek(
    call: &mut GuestCall<'_>,
    fd: u32,
    offset: i64,
    whence: u32,
    out: u32,
) -> Result<Flow, CallError> {
    let whence = u8::try_from(whence)
        .ok()
        .and_then(Whence::from_raw)
        .ok_or(Errno::Inval)?;
    let base = {
        let file = call.ctx.fds.get_file_mut(fd)?;
        match whence {
            Whence::Set => Some(0),
            Whence::Cur => Some(file.position as i64),
            Whence::End => file.size().map(|size| size as i64),
        }
    };
    match base {
        Some(base) => {
            apply_seek(call, fd, base, offset, out)?;
            Ok(Flow::Done)
        }
        // Seek from end needs the size; load the file first.
        None => {
            let handle = Rc::clone(&call.ctx.fds.get_file_mut(fd)?.handle);
            Ok(Flow::suspend(async move {
                let snapshot = handle.snapshot().await.map_err(map_fs)?;
                Ok(resume_with(move |call: &mut GuestCall<'_>| {
                    let file = call.ctx.fds.get_file_mut(fd)?;
                    file.install(snapshot);
                    let base = file.size().map(|size| size as i64).ok_or_else(not_loaded)?;
                    apply_seek(call, fd, base, offset, out)?;
                    Ok(Flow::Done)
                }))
            }))
        }
    }
}

fn apply_seek(
    call: &mut GuestCall<'_>,
    fd: u32,
    base: i64,
    offset: i64,
    out: u32,
) -> Result<(), CallError> {
    let target = base.checked_add(offset).ok_or(Errno::Inval)?;
    if target < 0 {
        return Err(Errno::Inval.into());
    }
    call.ctx.fds.get_file_mut(fd)?.position = target as u64;
    call.mem.write_u64(out, target as u64)?;
    Ok(())
}

fn sys_fd_tell(call: &mut GuestCall<'_>, fd: u32, out: u32) -> Result<Flow, CallError> {
    let position = call.ctx.fds.get_file_mut(fd)?.position;
    call.mem.write_u64(out, position)?;
    Ok(Flow::Done)
}

fn sys_fd_filestat_get(call: &mut GuestCall<'_>, fd: u32, out: u32) -> Result<Flow, CallError> {
    enum Target {
        Dir,
        Loaded(u64, u64),
        Unloaded(Rc<dyn FileHandle>),
    }
    let target = match call.ctx.fds.get(fd)? {
        FdEntry::Dir(_) | FdEntry::PreOpen(_) => Target::Dir,
        FdEntry::File(file) => match file.size() {
            Some(size) => Target::Loaded(size, file.modified_ms()),
            None => Target::Unloaded(Rc::clone(&file.handle)),
        },
    };
    match target {
        Target::Dir => {
            let stat = Filestat {
                filetype: Filetype::Directory as u8,
                ..Filestat::default()
            };
            stat.write(&mut call.mem, out)?;
            Ok(Flow::Done)
        }
        Target::Loaded(size, modified_ms) => {
            file_filestat(size, modified_ms).write(&mut call.mem, out)?;
            Ok(Flow::Done)
        }
        Target::Unloaded(handle) => Ok(Flow::suspend(async move {
            let snapshot = handle.snapshot().await.map_err(map_fs)?;
            Ok(resume_with(move |call: &mut GuestCall<'_>| {
                let file = call.ctx.fds.get_file_mut(fd)?;
                file.install(snapshot);
                let size = file.size().ok_or_else(not_loaded)?;
                let modified_ms = file.modified_ms();
                file_filestat(size, modified_ms).write(&mut call.mem, out)?;
                Ok(Flow::Done)
            }))
        })),
    }
}

fn sys_fd_filestat_set_size(
    call: &mut GuestCall<'_>,
    fd: u32,
    size: i64,
) -> Result<Flow, CallError> {
    if size < 0 {
        return Err(Errno::Inval.into());
    }
    let size = size as u64;
    let file = call.ctx.fds.get_file_mut(fd)?;
    if file.is_loaded() {
        if let Some(contents) = file.contents_mut() {
            contents.resize(size as usize, 0);
        }
        file.touch();
        return Ok(Flow::Done);
    }
    let handle = Rc::clone(&file.handle);
    Ok(Flow::suspend(async move {
        handle.set_size(size).await.map_err(map_fs)?;
        Ok(resume_with(|_call: &mut GuestCall<'_>| Ok(Flow::Done)))
    }))
}

/// `fd_datasync` and `fd_sync` share the same behavior: write back the
/// dirty cache, or ask the host to flush; a no-op for stdio.
fn sys_fd_sync(call: &mut GuestCall<'_>, fd: u32) -> Result<Flow, CallError> {
    enum Target {
        Noop,
        Dirty(Rc<dyn FileHandle>, Vec<u8>),
        Clean(Rc<dyn FileHandle>),
    }
    let target = match call.ctx.fds.get(fd) {
        Err(_) if fd <= 2 => Target::Noop,
        Err(err) => return Err(err.into()),
        Ok(FdEntry::Dir(_)) | Ok(FdEntry::PreOpen(_)) => Target::Noop,
        Ok(FdEntry::File(file)) => {
            if file.is_dirty() {
                Target::Dirty(
                    Rc::clone(&file.handle),
                    file.contents().map(<[u8]>::to_vec).unwrap_or_default(),
                )
            } else {
                Target::Clean(Rc::clone(&file.handle))
            }
        }
    };
    match target {
        Target::Noop => Ok(Flow::Done),
        Target::Dirty(handle, contents) => Ok(Flow::suspend(async move {
            write_back(handle.as_ref(), &contents).await?;
            Ok(resume_with(move |call: &mut GuestCall<'_>| {
                call.ctx.fds.get_file_mut(fd)?.mark_clean();
                Ok(Flow::Done)
            }))
        })),
        Target::Clean(handle) => Ok(Flow::suspend(async move {
            handle.flush().await.map_err(map_fs)?;
            Ok(resume_with(|_call: &mut GuestCall<'_>| Ok(Flow::Done)))
        })),
    }
}

// ─── directories ───────────────────────────────────────────────────

fn sys_fd_readdir(
    call: &mut GuestCall<'_>,
    fd: u32,
    buf: u32,
    buf_len: u32,
    cookie: u64,
    used_ptr: u32,
) -> Result<Flow, CallError> {
    let handle: Rc<dyn DirHandle> = match call.ctx.fds.get(fd)? {
        FdEntry::Dir(dir) => Rc::clone(&dir.handle),
        FdEntry::PreOpen(preopen) => Rc::clone(&preopen.handle),
        FdEntry::File(_) => return Err(Errno::Notdir.into()),
    };
    let cancel = call.ctx.cancel_token();
    Ok(Flow::suspend(async move {
        let mut iter = EntryIter::fetch(handle.as_ref(), cookie)
            .await
            .map_err(map_fs)?;
        let mut packed: Vec<u8> = Vec::new();
        while let Some(entry) = iter.next_entry() {
            if cancel.is_cancelled() {
                return Err(Errno::Canceled.into());
            }
            let dirent_len = Dirent::SIZE as usize + entry.name.len();
            if packed.len() + dirent_len > buf_len as usize {
                iter.revert(entry);
                break;
            }
            let dirent = Dirent {
                next: iter.position(),
                ino: 0,
                name_len: entry.name.len() as u32,
                kind: match entry.kind {
                    EntryKind::File => Filetype::RegularFile,
                    EntryKind::Directory => Filetype::Directory,
                },
            };
            let mut scratch = vec![0u8; Dirent::SIZE as usize];
            dirent.write(&mut GuestMemory::new(&mut scratch), 0)?;
            packed.extend_from_slice(&scratch);
            packed.extend_from_slice(entry.name.as_bytes());
        }
        Ok(resume_with(move |call: &mut GuestCall<'_>| {
            call.mem.write_bytes(buf, &packed)?;
            call.mem.write_u32(used_ptr, packed.len() as u32)?;
            Ok(Flow::Done)
        }))
    }))
}

// ─── path operations ───────────────────────────────────────────────

fn sys_path_open(
    call: &mut GuestCall<'_>,
    dirfd: u32,
    _dirflags: u32,
    path: u32,
    path_len: u32,
    oflags: u32,
    _rights_base: u64,
    _rights_inheriting: u64,
    fdflags: u32,
    out: u32,
) -> Result<Flow, CallError> {
    let fdflags = fdflags as u16;
    if fdflags & FdFlags::NONBLOCK.bits() != 0 {
        // Every fd here behaves as blocking; the asyncify layer hides the
        // waiting from the host, not from the guest.
        log::warn!("path_open: ignoring NONBLOCK fd-flag");
    }
    if fdflags & !FdFlags::NONBLOCK.bits() != 0 {
        return Err(Errno::Nosys.into());
    }
    let oflags = OFlags::from_bits_truncate(oflags as u16);

    let handle = Rc::clone(&call.ctx.fds.get_preopen(dirfd)?.handle);
    let rel = resolve_path(call.mem.read_str(path, path_len)?)?;
    let kind = if oflags.contains(OFlags::DIRECTORY) {
        NodeKind::Dir
    } else if oflags.contains(OFlags::CREAT) {
        NodeKind::File
    } else {
        NodeKind::Any
    };
    let mut host_flags = OpenFlags::empty();
    if oflags.contains(OFlags::CREAT) {
        host_flags |= OpenFlags::CREATE;
    }
    if oflags.contains(OFlags::EXCL) {
        host_flags |= OpenFlags::EXCLUSIVE;
    }

    Ok(Flow::suspend(async move {
        let node = handle.open(&rel, kind, host_flags).await.map_err(map_fs)?;
        if let Node::File(file) = &node {
            if oflags.contains(OFlags::TRUNC) {
                file.set_size(0).await.map_err(map_fs)?;
            }
        }
        Ok(resume_with(move |call: &mut GuestCall<'_>| {
            let entry = match node {
                Node::Dir(handle) => {
                    if oflags.contains(OFlags::TRUNC) {
                        return Err(Errno::Isdir.into());
                    }
                    FdEntry::Dir(OpenDirectory { handle })
                }
                Node::File(handle) => {
                    if oflags.contains(OFlags::DIRECTORY) {
                        return Err(Errno::Notdir.into());
                    }
                    if oflags.contains(OFlags::TRUNC) {
                        FdEntry::File(OpenFile::created(handle))
                    } else {
                        FdEntry::File(OpenFile::new(handle))
                    }
                }
            };
            let new_fd = call.ctx.fds.insert(entry);
            call.mem.write_u32(out, new_fd)?;
            Ok(Flow::Done)
        }))
    }))
}

fn sys_path_create_directory(
    call: &mut GuestCall<'_>,
    dirfd: u32,
    path: u32,
    path_len: u32,
) -> Result<Flow, CallError> {
    let handle = Rc::clone(&call.ctx.fds.get_preopen(dirfd)?.handle);
    let rel = resolve_path(call.mem.read_str(path, path_len)?)?;
    Ok(Flow::suspend(async move {
        handle
            .open(
                &rel,
                NodeKind::Dir,
                OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
            )
            .await
            .map_err(map_fs)?;
        Ok(resume_with(|_call: &mut GuestCall<'_>| Ok(Flow::Done)))
    }))
}

fn sys_path_remove_directory(
    call: &mut GuestCall<'_>,
    dirfd: u32,
    path: u32,
    path_len: u32,
) -> Result<Flow, CallError> {
    path_delete(call, dirfd, path, path_len)
}

fn sys_path_unlink_file(
    call: &mut GuestCall<'_>,
    dirfd: u32,
    path: u32,
    path_len: u32,
) -> Result<Flow, CallError> {
    path_delete(call, dirfd, path, path_len)
}

fn path_delete(
    call: &mut GuestCall<'_>,
    dirfd: u32,
    path: u32,
    path_len: u32,
) -> Result<Flow, CallError> {
    let handle = Rc::clone(&call.ctx.fds.get_preopen(dirfd)?.handle);
    let rel = resolve_path(call.mem.read_str(path, path_len)?)?;
    Ok(Flow::suspend(async move {
        handle.delete(&rel).await.map_err(map_fs)?;
        Ok(resume_with(|_call: &mut GuestCall<'_>| Ok(Flow::Done)))
    }))
}

fn sys_path_filestat_get(
    call: &mut GuestCall<'_>,
    dirfd: u32,
    _flags: u32,
    path: u32,
    path_len: u32,
    out: u32,
) -> Result<Flow, CallError> {
    let handle = Rc::clone(&call.ctx.fds.get_preopen(dirfd)?.handle);
    let rel = resolve_path(call.mem.read_str(path, path_len)?)?;
    Ok(Flow::suspend(async move {
        let node = handle
            .open(&rel, NodeKind::Any, OpenFlags::empty())
            .await
            .map_err(map_fs)?;
        let stat = match node {
            Node::Dir(_) => Filestat {
                filetype: Filetype::Directory as u8,
                ..Filestat::default()
            },
            Node::File(file) => {
                let snapshot = file.snapshot().await.map_err(map_fs)?;
                file_filestat(snapshot.size, snapshot.modified_ms)
            }
        };
        Ok(resume_with(move |call: &mut GuestCall<'_>| {
            stat.write(&mut call.mem, out)?;
            Ok(Flow::Done)
        }))
    }))
}

// Links, renames and time mutation are deliberately unimplemented.

fn sys_path_filestat_set_times(
    _call: &mut GuestCall<'_>,
    _dirfd: u32,
    _flags: u32,
    _path: u32,
    _path_len: u32,
    _atim: i64,
    _mtim: i64,
    _fst_flags: u32,
) -> Result<Flow, CallError> {
    Err(Errno::Nosys.into())
}

fn sys_path_link(
    _call: &mut GuestCall<'_>,
    _old_fd: u32,
    _old_flags: u32,
    _old_path: u32,
    _old_len: u32,
    _new_fd: u32,
    _new_path: u32,
    _new_len: u32,
) -> Result<Flow, CallError> {
    Err(Errno::Nosys.into())
}

fn sys_path_readlink(
    _call: &mut GuestCall<'_>,
    _dirfd: u32,
    _path: u32,
    _path_len: u32,
    _buf: u32,
    _buf_len: u32,
    _used: u32,
) -> Result<Flow, CallError> {
    Err(Errno::Nosys.into())
}

fn sys_path_rename(
    _call: &mut GuestCall<'_>,
    _old_fd: u32,
    _old_path: u32,
    _old_len: u32,
    _new_fd: u32,
    _new_path: u32,
    _new_len: u32,
) -> Result<Flow, CallError> {
    Err(Errno::Nosys.into())
}

fn sys_path_symlink(
    _call: &mut GuestCall<'_>,
    _old_path: u32,
    _old_len: u32,
    _dirfd: u32,
    _new_path: u32,
    _new_len: u32,
) -> Result<Flow, CallError> {
    Err(Errno::Nosys.into())
}

// ─── poll ──────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
struct ClockWait {
    timeout_ms: u64,
    precision_ms: u64,
    userdata: u64,
}

fn sys_poll_oneoff(
    call: &mut GuestCall<'_>,
    subs_ptr: u32,
    events_ptr: u32,
    nsubs: u32,
    used_ptr: u32,
) -> Result<Flow, CallError> {
    if nsubs == 0 {
        return Err(CallError::Fault(
            "poll_oneoff: at least one subscription is required".into(),
        ));
    }
    let mut clocks: Vec<ClockWait> = Vec::new();
    let mut immediate: Vec<Event> = Vec::new();
    for i in 0..nsubs {
        let sub = Subscription::read(&call.mem, subs_ptr + i * Subscription::SIZE)?;
        match sub.content {
            SubscriptionContent::Clock(clock) => {
                let relative_ns = if clock.flags.contains(ClockFlags::ABSTIME) {
                    clock.timeout_ns.saturating_sub(call.ctx.clock_ns(clock.id))
                } else {
                    clock.timeout_ns
                };
                clocks.push(ClockWait {
                    timeout_ms: relative_ns / 1_000_000,
                    precision_ms: clock.precision_ns / 1_000_000,
                    userdata: sub.userdata,
                });
            }
            // fd readiness is out of scope: report it unsupported, now.
            SubscriptionContent::FdRead(_) => immediate.push(Event {
                userdata: sub.userdata,
                error: Errno::Nosys,
                kind: EventKind::FdRead,
                nbytes: 0,
            }),
            SubscriptionContent::FdWrite(_) => immediate.push(Event {
                userdata: sub.userdata,
                error: Errno::Nosys,
                kind: EventKind::FdWrite,
                nbytes: 0,
            }),
        }
    }
    if !immediate.is_empty() {
        write_events(&mut call.mem, events_ptr, used_ptr, &immediate)?;
        return Ok(Flow::Done);
    }

    clocks.sort_by_key(|clock| clock.timeout_ms);
    let wait = clocks[0].timeout_ms + clocks[0].precision_ms;
    let ready: Vec<ClockWait> = clocks
        .iter()
        .take_while(|clock| clock.timeout_ms <= wait)
        .copied()
        .collect();
    let sleep_ms = match ready.last() {
        Some(clock) => clock.timeout_ms,
        None => 0,
    };
    let cancel = call.ctx.cancel_token();
    Ok(Flow::suspend(async move {
        tokio::select! {
            _ = cancel.cancelled() => Err(Errno::Canceled.into()),
            _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {
                let events: Vec<Event> = ready
                    .iter()
                    .map(|clock| Event {
                        userdata: clock.userdata,
                        error: Errno::Success,
                        kind: EventKind::Clock,
                        nbytes: 0,
                    })
                    .collect();
                Ok(resume_with(move |call: &mut GuestCall<'_>| {
                    write_events(&mut call.mem, events_ptr, used_ptr, &events)?;
                    Ok(Flow::Done)
                }))
            }
        }
    }))
}

// ─── Tests ─────────────────────────────────────────────────────────
