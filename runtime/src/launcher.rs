//! Invocation driver.
//!
//! Assembles one run: mounts, argv/environ, std streams and the abort
//! token; instantiates the guest with the wrapped WASI imports; then either
//! runs `_start` to completion (run mode) or hands back a [`GuestHandle`]
//! for calling arbitrary exports (export mode).

use std::rc::Rc;

use tokio_util::sync::CancellationToken;
use wasmi::{Engine, Linker, Module, Store, Val};

use strand_storage::DirHandle;

use crate::asyncify::{AsyncifiedInstance, HostState};
use crate::streams::{InputStream, NullIn, OutputStream, SinkOut};
use crate::wasi::{self, WasiCtx};
use crate::RuntimeError;

/// Everything one guest run needs. Built with the `with_*` methods;
/// defaults are an empty stdin, discarding outputs, no arguments, no
/// environment and a fresh abort token.
pub struct Invocation {
    preopens: Vec<(String, Rc<dyn DirHandle>)>,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Rc<dyn InputStream>,
    stdout: Rc<dyn OutputStream>,
    stderr: Rc<dyn OutputStream>,
    cancel: CancellationToken,
}

impl Invocation {
    pub fn new() -> Self {
        Invocation {
            preopens: Vec::new(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: Rc::new(NullIn),
            stdout: Rc::new(SinkOut),
            stderr: Rc::new(SinkOut),
            cancel: CancellationToken::new(),
        }
    }

    /// Mount a host directory at an absolute guest path.
    pub fn preopen(mut self, guest_path: impl Into<String>, handle: Rc<dyn DirHandle>) -> Self {
        self.preopens.push((guest_path.into(), handle));
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, stream: Rc<dyn InputStream>) -> Self {
        self.stdin = stream;
        self
    }

    pub fn stdout(mut self, stream: Rc<dyn OutputStream>) -> Self {
        self.stdout = stream;
        self
    }

    pub fn stderr(mut self, stream: Rc<dyn OutputStream>) -> Self {
        self.stderr = stream;
        self
    }

    /// Use an externally controlled abort token; cancelling it makes every
    /// subsequent WASI call return `CANCELED` to the guest.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

impl Default for Invocation {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `_start` and return the guest's exit code (0 when `_start` returns
/// normally, the `proc_exit` status otherwise).
pub async fn run(wasm: &[u8], invocation: Invocation) -> Result<u32, RuntimeError> {
    let mut guest = GuestHandle::instantiate(wasm, invocation)?;
    let status = match guest.invoke("_start", &[]).await {
        Ok(_) => 0,
        Err(RuntimeError::Exit(code)) => code,
        Err(err) => return Err(err),
    };
    guest.flush_files().await?;
    log::debug!("guest finished with status {}", status);
    Ok(status)
}

/// An instantiated guest for export mode: call any export through the
/// asyncify trampoline.
pub struct GuestHandle {
    inner: AsyncifiedInstance,
}

impl std::fmt::Debug for GuestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestHandle").finish_non_exhaustive()
    }
}

impl GuestHandle {
    pub fn instantiate(wasm: &[u8], invocation: Invocation) -> Result<Self, RuntimeError> {
        let engine = Engine::default();
        let module = Module::new(&engine, wasm)
            .map_err(|err| RuntimeError::InvalidModule(err.to_string()))?;

        let mut wasi_ctx = WasiCtx::new(
            invocation.args,
            invocation.env,
            invocation.stdin,
            invocation.stdout,
            invocation.stderr,
            invocation.cancel,
        )?;
        for (guest_path, handle) in invocation.preopens {
            wasi_ctx.push_preopen(guest_path, handle);
        }

        let mut store = Store::new(&engine, HostState::new(wasi_ctx));
        let mut linker = Linker::new(&engine);
        wasi::add_to_linker(&mut linker)
            .map_err(|err| RuntimeError::Instantiation(err.to_string()))?;
        let instance = linker
            .instantiate(&mut store, &module)
            .and_then(|pre| pre.start(&mut store))
            .map_err(|err| RuntimeError::Instantiation(err.to_string()))?;

        Ok(GuestHandle {
            inner: AsyncifiedInstance::new(store, instance)?,
        })
    }

    /// Call an export. Arguments are passed on the first entry only;
    /// re-entries after a suspension recover them from the asyncified
    /// stack.
    pub async fn invoke(&mut self, name: &str, args: &[Val]) -> Result<Vec<Val>, RuntimeError> {
        self.inner.invoke(name, args).await
    }

    /// Write every dirty open file back to the host. Called by [`run`]
    /// after the guest finishes so data survives an exit without
    /// `fd_close`.
    pub async fn flush_files(&mut self) -> Result<(), RuntimeError> {
        let dirty = self.inner.state_mut().wasi.fds.take_dirty_files();
        for (handle, contents) in dirty {
            let result = async {
                let mut writer = handle.writer(false).await?;
                writer.write(&contents).await?;
                writer.close().await
            }
            .await;
            result.map_err(|err| RuntimeError::Fault(format!("final flush: {}", err)))?;
        }
        Ok(())
    }
}
