use crate::{
    context::Context,
    error::{Result, Status},
    rpc::{Endpoint, Rpc, RpcHandle},
};

/// Information handed to a completion callback.
pub struct CbInfo<'a> {
    pub rpc: &'a RpcHandle,
    pub status: Status,
}

/// Lower-level transport the RPC core drives (the HG layer). Endpoint
/// resolution, wire serialization and the event loop all live behind this
/// trait; the core only sequences the calls and owns request lifetime.
///
/// Completions travel the other way: when `progress` observes a finished
/// operation the transport calls [`Context::deliver_completion`] for it.
pub trait Transport: Send + Sync {
    /// Associate a freshly allocated request with the transport.
    fn req_create(&self, ep: &Endpoint, rpc: &RpcHandle) -> Result<()>;

    /// Put the request on the wire. Must only be called for requests the
    /// tracker released.
    fn req_send(&self, rpc: &RpcHandle) -> Result<()>;

    /// Drop the transport's side of a request. Called exactly once, when
    /// the request's refcount reaches zero.
    fn req_destroy(&self, rpc: &Rpc) -> Result<()>;

    /// Advisory cancellation; the completion callback still runs, with a
    /// cancel status.
    fn req_cancel(&self, rpc: &RpcHandle) -> Result<()>;

    /// Send the reply for an incoming (server-side) request.
    fn reply_send(&self, rpc: &RpcHandle) -> Result<()>;

    /// Drive transport I/O for at most `timeout_us` microseconds.
    /// Returns `Err(Error::TimedOut)` when no event fired within the
    /// interval; that is the idle case, not a failure.
    fn progress(&self, ctx: &Context, timeout_us: u64) -> Result<()>;
}
