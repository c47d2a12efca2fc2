//! RPC substrate for a distributed storage service: point-to-point and
//! collective request handling over a pluggable transport, plus a pool of
//! mmap()'ed growable stacks for the user-level threads that drive it.
//!
//! The building blocks, bottom up:
//!
//! * [`opcode`] — the opcode registry mapping each RPC type to its buffer
//!   formats, handler and collective operations.
//! * [`rpc`] — request objects: refcounted records with lazily sized
//!   input/output buffers, async send, a blocking send bridge, reply and
//!   abort.
//! * [`context`] — per-context tracking of in-flight requests with a
//!   per-endpoint concurrency bound, and the progress entry point.
//! * [`corpc`] — collective RPC: one parent fanned out across a group's
//!   membership (minus excluded ranks), child completions aggregated into
//!   exactly one parent completion.
//! * [`transport`] — the seam to the lower HG-style transport layer.
//! * [`stack_pool`] / [`ult`] — guard-paged, growing-downward ULT stacks,
//!   recycled through a bounded free list and returned automatically when
//!   a ULT exits.

pub mod context;
pub mod corpc;
pub mod error;
pub mod group;
pub mod opcode;
pub mod rpc;
pub mod stack_pool;
pub mod transport;
pub mod ult;

pub use crate::{
    context::{Context, Instance, EP_MAX_INFLIGHT},
    corpc::{BulkHandle, CorpcFlags, TreeTopo},
    error::{Error, Result, Status},
    group::{Group, GroupDirectory, GroupId, Rank, RankList},
    opcode::{
        CorpcOps, Handler, OpcInfo, Opcode, OpcodeRegistry, RequestFormat, MAX_INPUT_SIZE,
        MAX_OUTPUT_SIZE, OPC_GRP_CREATE, OPC_GRP_DESTROY, OPC_URI_LOOKUP,
    },
    rpc::{Endpoint, Rpc, RpcHandle, RpcHeader, RpcState, DEFAULT_TIMEOUT_US},
    stack_pool::{
        PoolStats, StackDesc, StackPool, DEFAULT_STACK_SIZE, MAX_NUMBER_FREE_STACKS,
        MAX_PERCENT_FREE_STACKS, STACK_POOL,
    },
    transport::{CbInfo, Transport},
    ult::{ult_create, ult_create_on_xstream, UltAttr, UltSpawner, XstreamId},
};
