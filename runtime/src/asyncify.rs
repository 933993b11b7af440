//! Asyncify controller.
//!
//! The guest is compiled synchronously but the host cannot block. Asyncified
//! modules export hooks that save and restore the guest's own call stack
//! into a region of linear memory; this module drives them.
//!
//! An import that cannot finish immediately parks its continuation in the
//! store ([`Suspension`]) and starts an unwind: every guest frame returns
//! until the outermost export call comes back to the host with the asyncify
//! state still `Unwinding`. The export driver then awaits the parked future,
//! applies its resume step to guest memory, starts a rewind and re-enters
//! the export. The guest fast-forwards to the original call site, where the
//! import wrapper hands it the resolved value.

use std::future::Future;
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use wasmi::core::ValType;
use wasmi::{AsContextMut, Caller, Extern, Func, Instance, Memory, Store, Val};

use crate::abi::Errno;
use crate::memory::GuestMemory;
use crate::wasi::WasiCtx;
use crate::{ExitStatus, HostFault, RuntimeError};

/// Address of the asyncify descriptor: two little-endian u32 words holding
/// the bounds of the stack-save region.
pub const DATA_ADDR: u32 = 16;
/// First byte of the stack-save region (directly after the descriptor).
pub const DATA_START: u32 = 24;
/// One past the last byte of the stack-save region.
pub const DATA_END: u32 = 1024;

/// The asyncify state machine, as reported by `asyncify_get_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncifyState {
    Normal = 0,
    Unwinding = 1,
    Rewinding = 2,
}

impl AsyncifyState {
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(AsyncifyState::Normal),
            1 => Some(AsyncifyState::Unwinding),
            2 => Some(AsyncifyState::Rewinding),
            _ => None,
        }
    }
}

/// Error channel of a WASI call implementation.
#[derive(Debug)]
pub enum CallError {
    /// A WASI errno; becomes the call's return value.
    Sys(Errno),
    /// A host programming error; aborts the whole invocation.
    Fault(String),
}

impl From<Errno> for CallError {
    fn from(errno: Errno) -> Self {
        CallError::Sys(errno)
    }
}

/// Guest memory plus WASI context, valid for the duration of one call or
/// resume step.
pub struct GuestCall<'a> {
    pub mem: GuestMemory<'a>,
    pub ctx: &'a mut WasiCtx,
}

/// Continuation applied to guest state once a suspension's future has
/// resolved.
pub type Resume = Box<dyn FnOnce(&mut GuestCall<'_>) -> Result<Flow, CallError>>;

/// A parked WASI call: a future owning everything it needs (host handles,
/// parsed arguments, copied buffers) that resolves to the resume step.
pub struct Suspension {
    pub(crate) future: LocalBoxFuture<'static, Result<Resume, CallError>>,
}

/// Outcome of a WASI call body or resume step.
pub enum Flow {
    /// Finished; the call returns success (or `Canceled` if the abort
    /// token fired meanwhile).
    Done,
    /// Host work outstanding.
    Suspend(Suspension),
}

impl Flow {
    /// Park `future` as this call's outstanding host work.
    pub fn suspend<F>(future: F) -> Flow
    where
        F: Future<Output = Result<Resume, CallError>> + 'static,
    {
        Flow::Suspend(Suspension {
            future: future.boxed_local(),
        })
    }
}

/// Box a resume closure.
pub fn resume_with<F>(f: F) -> Resume
where
    F: FnOnce(&mut GuestCall<'_>) -> Result<Flow, CallError> + 'static,
{
    Box::new(f)
}

/// Store data: WASI context plus the controller's stash.
pub struct HostState {
    pub wasi: WasiCtx,
    /// The parked call while the guest is unwound.
    pub(crate) pending: Option<Suspension>,
    /// The resolved return value, consumed at the rewound call site.
    pub(crate) resolved: Option<i32>,
}

impl HostState {
    pub fn new(wasi: WasiCtx) -> Self {
        HostState {
            wasi,
            pending: None,
            resolved: None,
        }
    }
}

/// Handles to the guest's memory and asyncify hook exports.
pub(crate) struct AsyncifyHooks {
    pub(crate) memory: Memory,
    get_state: Func,
    start_unwind: Func,
    stop_unwind: Func,
    start_rewind: Func,
    stop_rewind: Func,
}

impl AsyncifyHooks {
    pub(crate) fn from_caller(caller: &Caller<'_, HostState>) -> Result<Self, wasmi::Error> {
        let memory = match caller.get_export("memory") {
            Some(Extern::Memory(memory)) => memory,
            _ => return Err(wasmi::Error::new("guest does not export \"memory\"")),
        };
        let func = |name: &str| {
            caller
                .get_export(name)
                .and_then(Extern::into_func)
                .ok_or_else(|| wasmi::Error::new(format!("guest does not export \"{}\"", name)))
        };
        Ok(AsyncifyHooks {
            memory,
            get_state: func("asyncify_get_state")?,
            start_unwind: func("asyncify_start_unwind")?,
            stop_unwind: func("asyncify_stop_unwind")?,
            start_rewind: func("asyncify_start_rewind")?,
            stop_rewind: func("asyncify_stop_rewind")?,
        })
    }

    fn from_instance(
        instance: &Instance,
        store: &Store<HostState>,
    ) -> Result<Self, RuntimeError> {
        let memory = instance
            .get_export(store, "memory")
            .and_then(Extern::into_memory)
            .ok_or_else(|| RuntimeError::MissingExport("memory".into()))?;
        let func = |name: &str| {
            instance
                .get_export(store, name)
                .and_then(Extern::into_func)
                .ok_or_else(|| RuntimeError::MissingExport(name.into()))
        };
        Ok(AsyncifyHooks {
            memory,
            get_state: func("asyncify_get_state")?,
            start_unwind: func("asyncify_start_unwind")?,
            stop_unwind: func("asyncify_stop_unwind")?,
            start_rewind: func("asyncify_start_rewind")?,
            stop_rewind: func("asyncify_stop_rewind")?,
        })
    }

    pub(crate) fn state(
        &self,
        mut ctx: impl AsContextMut<Data = HostState>,
    ) -> Result<AsyncifyState, wasmi::Error> {
        let mut results = [Val::I32(0)];
        self.get_state.call(&mut ctx, &[], &mut results)?;
        match &results[0] {
            Val::I32(raw) => AsyncifyState::from_raw(*raw)
                .ok_or_else(|| wasmi::Error::new(format!("bad asyncify state {}", raw))),
            _ => Err(wasmi::Error::new("asyncify_get_state returned a non-i32")),
        }
    }

    pub(crate) fn start_unwind(
        &self,
        mut ctx: impl AsContextMut<Data = HostState>,
        addr: u32,
    ) -> Result<(), wasmi::Error> {
        self.start_unwind.call(&mut ctx, &[Val::I32(addr as i32)], &mut [])
    }

    pub(crate) fn stop_unwind(
        &self,
        mut ctx: impl AsContextMut<Data = HostState>,
    ) -> Result<(), wasmi::Error> {
        self.stop_unwind.call(&mut ctx, &[], &mut [])
    }

    pub(crate) fn start_rewind(
        &self,
        mut ctx: impl AsContextMut<Data = HostState>,
        addr: u32,
    ) -> Result<(), wasmi::Error> {
        self.start_rewind.call(&mut ctx, &[Val::I32(addr as i32)], &mut [])
    }

    pub(crate) fn stop_rewind(
        &self,
        mut ctx: impl AsContextMut<Data = HostState>,
    ) -> Result<(), wasmi::Error> {
        self.stop_rewind.call(&mut ctx, &[], &mut [])
    }
}

enum Step {
    Value(i32),
    Fault(String),
    Unwind,
}

/// The import wrapper shared by every WASI binding.
///
/// On a rewound call this returns the stashed value. Otherwise it runs the
/// body; a suspension is polled once so work that finishes immediately
/// returns synchronously, and anything still pending is parked before the
/// unwind starts.
pub fn trampoline<F>(
    caller: &mut Caller<'_, HostState>,
    name: &'static str,
    f: F,
) -> Result<i32, wasmi::Error>
where
    F: FnOnce(&mut GuestCall<'_>) -> Result<Flow, CallError>,
{
    let hooks = AsyncifyHooks::from_caller(caller)?;
    match hooks.state(&mut *caller)? {
        AsyncifyState::Rewinding => {
            hooks.stop_rewind(&mut *caller)?;
            let value = caller.data_mut().resolved.take().ok_or_else(|| {
                wasmi::Error::new(format!("{}: rewound without a resolved value", name))
            })?;
            log::debug!("{}: resumed with {}", name, value);
            return Ok(value);
        }
        AsyncifyState::Normal => {}
        AsyncifyState::Unwinding => {
            return Err(wasmi::Error::new(format!(
                "{}: import called while unwinding",
                name
            )));
        }
    }

    let step = {
        let (bytes, state) = hooks.memory.data_and_store_mut(&mut *caller);
        let HostState { wasi, pending, .. } = state;
        let mut call = GuestCall {
            mem: GuestMemory::new(bytes),
            ctx: wasi,
        };
        let first = f(&mut call);
        drive_step(first, &mut call, pending)
    };
    match step {
        Step::Value(value) => Ok(value),
        Step::Fault(msg) => Err(wasmi::Error::host(HostFault(msg))),
        Step::Unwind => {
            log::debug!("{}: suspending", name);
            hooks.start_unwind(&mut *caller, DATA_ADDR)?;
            Ok(Errno::Success.raw())
        }
    }
}

/// Drive a call body synchronously as far as it will go.
fn drive_step(
    first: Result<Flow, CallError>,
    call: &mut GuestCall<'_>,
    pending: &mut Option<Suspension>,
) -> Step {
    let mut flow = first;
    loop {
        match flow {
            Ok(Flow::Done) => return Step::Value(finish(call.ctx)),
            Err(CallError::Sys(errno)) => return Step::Value(errno.raw()),
            Err(CallError::Fault(msg)) => return Step::Fault(msg),
            Ok(Flow::Suspend(mut suspension)) => match poll_once(&mut suspension) {
                Poll::Pending => {
                    *pending = Some(suspension);
                    return Step::Unwind;
                }
                Poll::Ready(Ok(resume)) => flow = resume(call),
                Poll::Ready(Err(CallError::Sys(errno))) => return Step::Value(errno.raw()),
                Poll::Ready(Err(CallError::Fault(msg))) => return Step::Fault(msg),
            },
        }
    }
}

/// Cancellation is checked after successful completion of every call.
fn finish(ctx: &WasiCtx) -> i32 {
    if ctx.cancelled() {
        Errno::Canceled.raw()
    } else {
        Errno::Success.raw()
    }
}

fn poll_once(suspension: &mut Suspension) -> Poll<Result<Resume, CallError>> {
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    suspension.future.as_mut().poll(&mut cx)
}

fn wasm_err(err: wasmi::Error) -> RuntimeError {
    RuntimeError::Wasm(err.to_string())
}

fn zero_val(ty: &ValType) -> Result<Val, RuntimeError> {
    match ty {
        ValType::I32 => Ok(Val::I32(0)),
        ValType::I64 => Ok(Val::I64(0)),
        ValType::F32 => Ok(Val::F32(0f32.into())),
        ValType::F64 => Ok(Val::F64(0f64.into())),
        _ => Err(RuntimeError::Fault(
            "reference-typed export signatures are not supported".into(),
        )),
    }
}

/// An instantiated asyncified guest plus its store; exports are driven
/// through the unwind/rewind loop.
pub struct AsyncifiedInstance {
    store: Store<HostState>,
    instance: Instance,
    hooks: AsyncifyHooks,
}

impl AsyncifiedInstance {
    /// Validate the asyncify ABI and write the stack descriptor at
    /// [`DATA_ADDR`].
    pub fn new(mut store: Store<HostState>, instance: Instance) -> Result<Self, RuntimeError> {
        let hooks = AsyncifyHooks::from_instance(&instance, &store)?;
        hooks
            .memory
            .write(&mut store, DATA_ADDR as usize, &DATA_START.to_le_bytes())
            .and_then(|_| {
                hooks
                    .memory
                    .write(&mut store, DATA_ADDR as usize + 4, &DATA_END.to_le_bytes())
            })
            .map_err(|err| {
                RuntimeError::Instantiation(format!("asyncify descriptor: {}", err))
            })?;
        Ok(AsyncifiedInstance {
            store,
            instance,
            hooks,
        })
    }

    pub fn state(&self) -> &HostState {
        self.store.data()
    }

    pub fn state_mut(&mut self) -> &mut HostState {
        self.store.data_mut()
    }

    /// Call an export through the unwind/rewind loop.
    ///
    /// While the guest reports `Unwinding` after a call returns, the parked
    /// future is awaited here, its resume step applied, and the export
    /// re-entered with zeroed arguments: the real ones are preserved inside
    /// the asyncified stack, and passing them again would corrupt the
    /// rewind.
    pub async fn invoke(&mut self, name: &str, args: &[Val]) -> Result<Vec<Val>, RuntimeError> {
        let func = self
            .instance
            .get_export(&self.store, name)
            .and_then(Extern::into_func)
            .ok_or_else(|| RuntimeError::MissingExport(name.to_string()))?;
        let ty = func.ty(&self.store);
        let mut results: Vec<Val> = ty.results().iter().map(zero_val).collect::<Result<_, _>>()?;
        let rewind_args: Vec<Val> = ty.params().iter().map(zero_val).collect::<Result<_, _>>()?;

        self.expect_normal("before export call")?;
        let mut rewinding = false;
        loop {
            let call_args: &[Val] = if rewinding { &rewind_args } else { args };
            if let Err(err) = func.call(&mut self.store, call_args, &mut results) {
                if let Some(exit) = err.downcast_ref::<ExitStatus>() {
                    log::debug!("guest exited with status {}", exit.0);
                    return Err(RuntimeError::Exit(exit.0));
                }
                if let Some(fault) = err.downcast_ref::<HostFault>() {
                    return Err(RuntimeError::Fault(fault.0.clone()));
                }
                return Err(wasm_err(err));
            }
            match self.hooks.state(&mut self.store).map_err(wasm_err)? {
                AsyncifyState::Normal => break,
                AsyncifyState::Rewinding => {
                    return Err(RuntimeError::Fault(
                        "guest still rewinding after export returned".into(),
                    ));
                }
                AsyncifyState::Unwinding => {
                    self.hooks.stop_unwind(&mut self.store).map_err(wasm_err)?;
                    let suspension = self.store.data_mut().pending.take().ok_or_else(|| {
                        RuntimeError::Fault("guest unwound without a pending operation".into())
                    })?;
                    let resolved = self.settle(suspension).await?;
                    self.store.data_mut().resolved = Some(resolved);
                    self.expect_normal("before rewind")?;
                    self.hooks
                        .start_rewind(&mut self.store, DATA_ADDR)
                        .map_err(wasm_err)?;
                    rewinding = true;
                }
            }
        }
        Ok(results)
    }

    /// Await a parked call to completion. A resume step may park follow-up
    /// work; the guest sees a single suspension regardless of how many
    /// host-side awaits happen here.
    async fn settle(&mut self, mut suspension: Suspension) -> Result<i32, RuntimeError> {
        let memory = self.hooks.memory;
        loop {
            let resume = match suspension.future.await {
                Ok(resume) => resume,
                Err(CallError::Sys(errno)) => return Ok(errno.raw()),
                Err(CallError::Fault(msg)) => return Err(RuntimeError::Fault(msg)),
            };
            let next = {
                let (bytes, state) = memory.data_and_store_mut(&mut self.store);
                let HostState { wasi, .. } = state;
                let mut call = GuestCall {
                    mem: GuestMemory::new(bytes),
                    ctx: wasi,
                };
                match resume(&mut call) {
                    Ok(Flow::Done) => return Ok(finish(call.ctx)),
                    Ok(Flow::Suspend(next)) => next,
                    Err(CallError::Sys(errno)) => return Ok(errno.raw()),
                    Err(CallError::Fault(msg)) => return Err(RuntimeError::Fault(msg)),
                }
            };
            suspension = next;
        }
    }

    fn expect_normal(&mut self, when: &str) -> Result<(), RuntimeError> {
        match self.hooks.state(&mut self.store).map_err(wasm_err)? {
            AsyncifyState::Normal => Ok(()),
            other => Err(RuntimeError::Fault(format!(
                "unexpected asyncify state {:?} {}",
                other, when
            ))),
        }
    }
}

// ─── Tests ─────────────────────────────────────────────────────────
