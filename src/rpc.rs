use crate::{
    context::{Context, Tracked},
    corpc::{self, BulkHandle, CorpcInfo},
    error::{Error, Result, Status},
    group::{GroupId, Rank},
    opcode::{OpcInfo, Opcode, MAX_INPUT_SIZE, MAX_OUTPUT_SIZE},
    transport::CbInfo,
};
use log::{debug, error};
use spin::{Mutex as SpinMutex, MutexGuard as SpinMutexGuard};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Default deadline for [`Rpc::send_sync`], in microseconds.
pub const DEFAULT_TIMEOUT_US: u64 = 20_000_000;

/// Interval handed to each progress call inside the sync bridge.
const PROGRESS_INTERVAL_US: u64 = 1000;

/// Destination of a request. A `None` group id addresses the primary
/// group implicitly.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub grp_id: Option<GroupId>,
    pub rank: Rank,
    pub tag: u32,
}

impl Endpoint {
    pub fn new(rank: Rank, tag: u32) -> Endpoint {
        Endpoint {
            grp_id: None,
            rank,
            tag,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcState {
    Inited,
    ReqSent,
    Completed,
    Canceled,
}

/// Common header carried by requests and replies; serialized by the
/// transport ahead of the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpcHeader {
    pub opc: Opcode,
    pub version: u32,
}

pub(crate) type CompletionCb = Box<dyn FnOnce(&CbInfo<'_>) + Send>;

pub type RpcHandle = Arc<Rpc>;

/// Mutable half of an RPC record, guarded by the per-RPC spinlock.
pub(crate) struct RpcInner {
    pub(crate) refcount: u32,
    pub(crate) state: RpcState,
    pub(crate) complete_cb: Option<CompletionCb>,
    pub(crate) corpc: Option<Box<CorpcInfo>>,
    pub(crate) co_bulk: Option<BulkHandle>,
    pub(crate) req_hdr: RpcHeader,
    pub(crate) reply_hdr: RpcHeader,
    /// Set once the refcount has hit zero and resources are gone.
    pub(crate) released: bool,
}

/// One RPC. The `Arc` carries the memory; the explicit refcount inside
/// carries the resource lifetime: when it drops to zero the transport
/// side is destroyed and the buffers are freed, exactly once.
///
/// A new request starts with refcount 1. `send` consumes that reference
/// (the completion path drops it, or `send` itself does on failure), so a
/// caller that wants to touch the request after `send` must `addref`
/// first.
pub struct Rpc {
    opc: Opcode,
    opc_info: Arc<OpcInfo>,
    ep: Endpoint,
    ctx: Arc<Context>,
    srv: bool,
    /// Whether the transport was told about this request (collective
    /// parents never are).
    hg: bool,
    input: SpinMutex<Vec<u8>>,
    output: SpinMutex<Vec<u8>>,
    pub(crate) inner: SpinMutex<RpcInner>,
}

/// Allocate an RPC record for `opc`: look the opcode up, size the buffers
/// from its format, and (unless it is a collective parent) introduce the
/// request to the transport.
pub(crate) fn create(
    ctx: &Arc<Context>,
    ep: Endpoint,
    opc: Opcode,
    srv: bool,
    hg: bool,
) -> Result<RpcHandle> {
    let opc_info = ctx.instance().registry().lookup(opc).ok_or_else(|| {
        error!("opc 0x{:x} lookup failed", opc);
        Error::Unreg(opc)
    })?;
    debug_assert!(
        opc_info.format.input_size <= MAX_INPUT_SIZE
            && opc_info.format.output_size <= MAX_OUTPUT_SIZE
    );
    let version = opc_info.version;
    let (input_size, output_size) = (opc_info.format.input_size, opc_info.format.output_size);
    let rpc = Arc::new(Rpc {
        opc,
        opc_info,
        ep,
        ctx: ctx.clone(),
        srv,
        hg,
        input: SpinMutex::new(vec![0u8; input_size]),
        output: SpinMutex::new(vec![0u8; output_size]),
        inner: SpinMutex::new(RpcInner {
            refcount: 1,
            state: RpcState::Inited,
            complete_cb: None,
            corpc: None,
            co_bulk: None,
            req_hdr: RpcHeader { opc, version },
            reply_hdr: RpcHeader { opc, version },
            released: false,
        }),
    });
    if hg {
        if let Err(rc) = ctx.transport().req_create(&rpc.ep, &rpc) {
            error!("transport req_create failed, rc: {}, opc: 0x{:x}", rc, opc);
            rpc.discard();
            return Err(rc);
        }
    }
    Ok(rpc)
}

impl Rpc {
    pub fn opcode(&self) -> Opcode {
        self.opc
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.ep
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn is_srv(&self) -> bool {
        self.srv
    }

    pub fn is_collective(&self) -> bool {
        self.inner.lock().corpc.is_some()
    }

    pub fn co_bulk(&self) -> Option<BulkHandle> {
        self.inner.lock().co_bulk
    }

    pub fn req_header(&self) -> RpcHeader {
        self.inner.lock().req_hdr
    }

    pub fn reply_header(&self) -> RpcHeader {
        self.inner.lock().reply_hdr
    }

    pub(crate) fn opc_info(&self) -> &Arc<OpcInfo> {
        &self.opc_info
    }

    /// Input buffer, sized per the opcode format. Filled by the caller
    /// before `send`; freed on final decref.
    pub fn input(&self) -> SpinMutexGuard<'_, Vec<u8>> {
        self.input.lock()
    }

    /// Output buffer; populated by the time the completion callback runs.
    pub fn output(&self) -> SpinMutexGuard<'_, Vec<u8>> {
        self.output.lock()
    }

    pub fn state(&self) -> RpcState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: RpcState) {
        self.inner.lock().state = state;
    }

    pub fn refcount(&self) -> u32 {
        self.inner.lock().refcount
    }

    pub fn addref(&self) {
        let mut g = self.inner.lock();
        g.refcount += 1;
    }

    /// Drop one reference. On the transition to zero the transport side
    /// is destroyed, then buffers and collective state are freed.
    pub fn decref(self: &Arc<Self>) {
        let destroy = {
            let mut g = self.inner.lock();
            debug_assert!(g.refcount > 0);
            g.refcount -= 1;
            g.refcount == 0
        };
        if !destroy {
            return;
        }
        if self.hg {
            if let Err(rc) = self.ctx.transport().req_destroy(self) {
                error!(
                    "transport req_destroy failed, rc: {}, opc: 0x{:x}",
                    rc, self.opc
                );
            }
        }
        self.discard();
    }

    /// Free buffers and collective state without touching the transport.
    fn discard(&self) {
        *self.input.lock() = Vec::new();
        *self.output.lock() = Vec::new();
        let mut g = self.inner.lock();
        g.corpc = None;
        g.complete_cb = None;
        g.released = true;
    }

    /// Send the request. `complete_cb` fires exactly once, on whatever
    /// thread drives progress, with the completion status. On error the
    /// caller's reference has been dropped either way: a point-to-point
    /// send fails without running the callback, while a collective send
    /// that fails mid-fan-out completes the parent before returning, so
    /// the callback has already run with the error.
    ///
    /// Collective requests fan out to the group here instead of going to
    /// the transport directly.
    pub fn send<C>(self: &Arc<Self>, complete_cb: C) -> Result<()>
    where
        C: FnOnce(&CbInfo<'_>) + Send + 'static,
    {
        let coll = {
            let mut g = self.inner.lock();
            if g.released {
                return Err(Error::Inval);
            }
            g.complete_cb = Some(Box::new(complete_cb));
            g.corpc.is_some()
        };
        if coll {
            let rc = corpc::corpc_send(self);
            if let Err(e) = &rc {
                error!("corpc send failed, rc: {}, opc: 0x{:x}", e, self.opc);
            }
            return rc;
        }
        match self.ctx.track(self) {
            Tracked::Inflight => {
                // set state before sending to avoid racing the completion
                self.set_state(RpcState::ReqSent);
                if let Err(rc) = self.ctx.transport().req_send(self) {
                    error!(
                        "transport req_send failed, rc: {}, opc: 0x{:x}",
                        rc, self.opc
                    );
                    self.set_state(RpcState::Inited);
                    self.ctx.untrack(self);
                    self.decref();
                    return Err(rc);
                }
                Ok(())
            }
            Tracked::Wait => Ok(()),
        }
    }

    /// Send and block until completion by polling the context's progress.
    /// `timeout_us == 0` selects the default 20 s deadline. Returns
    /// `Ok(())` once the completion callback has run (whatever its
    /// status; the output buffer tells the rest), `Err(TimedOut)` past
    /// the deadline, or the first non-timeout progress error.
    pub fn send_sync(self: &Arc<Self>, timeout_us: u64) -> Result<()> {
        let complete = Arc::new(AtomicBool::new(false));
        let flag = complete.clone();
        self.send(move |_cb| {
            flag.store(true, Ordering::Release);
        })?;

        // check if we are lucky
        if complete.load(Ordering::Acquire) {
            return Ok(());
        }

        let timeout_us = if timeout_us == 0 {
            DEFAULT_TIMEOUT_US
        } else {
            timeout_us
        };
        let deadline = Instant::now() + Duration::from_micros(timeout_us);
        loop {
            match self.ctx.progress(PROGRESS_INTERVAL_US) {
                Ok(()) | Err(Error::TimedOut) => {}
                Err(rc) => {
                    error!("progress failed, rc: {}", rc);
                    return Err(rc);
                }
            }
            if complete.load(Ordering::Acquire) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::TimedOut);
            }
        }
    }

    /// Send the reply for an incoming request.
    pub fn reply_send(self: &Arc<Self>) -> Result<()> {
        if let Err(rc) = self.ctx.transport().reply_send(self) {
            error!(
                "transport reply_send failed, rc: {}, opc: 0x{:x}",
                rc, self.opc
            );
            return Err(rc);
        }
        Ok(())
    }

    /// Advisory cancel, relayed to the transport. The completion callback
    /// still runs, with a cancel status.
    pub fn abort(self: &Arc<Self>) -> Result<()> {
        if let Err(rc) = self.ctx.transport().req_cancel(self) {
            error!(
                "transport req_cancel failed, rc: {}, opc: 0x{:x}",
                rc, self.opc
            );
            return Err(rc);
        }
        Ok(())
    }

    /// Complete the request: transition the state at most once, run the
    /// completion callback, then drop the in-flight reference. Late or
    /// duplicate completions are ignored.
    pub(crate) fn complete(self: &Arc<Self>, status: Status) {
        let cb = {
            let mut g = self.inner.lock();
            match g.state {
                RpcState::Completed | RpcState::Canceled => {
                    debug!("rpc opc 0x{:x} already completed", self.opc);
                    return;
                }
                RpcState::Inited | RpcState::ReqSent => {}
            }
            g.state = if status == Err(Error::Canceled) {
                RpcState::Canceled
            } else {
                RpcState::Completed
            };
            g.complete_cb.take()
        };
        self.ctx.untrack(self);
        if let Some(cb) = cb {
            cb(&CbInfo { rpc: self, status });
        }
        self.decref();
    }
}
