use crate::{
    corpc::{self, BulkHandle, CorpcFlags, TreeTopo},
    error::{Error, Result, Status},
    group::{Group, GroupDirectory, Rank, RankList},
    opcode::{self, CorpcOps, Handler, OpcInfo, Opcode, OpcodeRegistry, RequestFormat},
    rpc::{self, Endpoint, RpcHandle, RpcState},
    transport::Transport,
};
use log::error;
use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

/// Per-endpoint in-flight concurrency bound. Requests beyond this park in
/// the context wait queue until a slot frees.
pub const EP_MAX_INFLIGHT: usize = 32;

/// Process-level state shared by every context: the opcode registry, the
/// group directory and the primary service group.
pub struct Instance {
    registry: OpcodeRegistry,
    groups: GroupDirectory,
    primary: Arc<Group>,
    self_rank: Rank,
}

impl Instance {
    /// Set up an instance around its primary group and register the
    /// internal RPC table.
    pub fn init(primary: Arc<Group>, self_rank: Rank) -> Result<Arc<Instance>> {
        let inst = Instance {
            registry: OpcodeRegistry::new(),
            groups: GroupDirectory::new(),
            primary: primary.clone(),
            self_rank,
        };
        opcode::register_internal(&inst.registry)?;
        inst.groups.insert(primary)?;
        Ok(Arc::new(inst))
    }

    pub fn registry(&self) -> &OpcodeRegistry {
        &self.registry
    }

    pub fn groups(&self) -> &GroupDirectory {
        &self.groups
    }

    pub fn primary_group(&self) -> &Arc<Group> {
        &self.primary
    }

    pub fn self_rank(&self) -> Rank {
        self.self_rank
    }

    /// Register an extension opcode. Collisions with already-registered
    /// opcodes (internal ones included) are rejected.
    pub fn rpc_register(
        &self,
        opc: Opcode,
        name: &'static str,
        version: u32,
        format: RequestFormat,
        handler: Handler,
        co_ops: Option<CorpcOps>,
    ) -> Result<()> {
        self.registry.register(OpcInfo {
            opc,
            name,
            version,
            flags: 0,
            format,
            handler,
            co_ops,
        })
    }

    pub fn context(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Arc<Context> {
        Context::create(self.clone(), transport, EP_MAX_INFLIGHT)
    }

    /// Same as [`Instance::context`] with a custom per-endpoint in-flight
    /// bound.
    pub fn context_with_inflight(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        max_inflight: usize,
    ) -> Arc<Context> {
        Context::create(self.clone(), transport, max_inflight)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Tracked {
    Inflight,
    Wait,
}

struct Tracker {
    max_inflight: usize,
    inflight: HashMap<Endpoint, Vec<RpcHandle>>,
    waitq: VecDeque<RpcHandle>,
}

/// One RPC context: a transport binding plus the in-flight request
/// tracker. Outgoing requests are sorted into per-endpoint in-flight
/// queues up to the concurrency bound; the rest wait and are promoted as
/// slots free up.
pub struct Context {
    instance: Arc<Instance>,
    transport: Arc<dyn Transport>,
    tracker: Mutex<Tracker>,
}

impl Context {
    pub(crate) fn create(
        instance: Arc<Instance>,
        transport: Arc<dyn Transport>,
        max_inflight: usize,
    ) -> Arc<Context> {
        Arc::new(Context {
            instance,
            transport,
            tracker: Mutex::new(Tracker {
                max_inflight,
                inflight: HashMap::new(),
                waitq: VecDeque::new(),
            }),
        })
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Allocate a request for `opc` aimed at `tgt_ep`. The returned handle
    /// carries one reference; the input buffer is sized per the opcode's
    /// format and ready to be filled.
    pub fn req_create(self: &Arc<Self>, tgt_ep: Endpoint, opc: Opcode) -> Result<RpcHandle> {
        if tgt_ep.rank >= self.instance.primary.size() {
            error!(
                "invalid rank {}, group size: {}",
                tgt_ep.rank,
                self.instance.primary.size()
            );
            return Err(Error::Inval);
        }
        rpc::create(self, tgt_ep, opc, false, true)
    }

    /// Allocate the server-side record for an incoming request of `opc`.
    /// Transports call this on arrival, fill the input buffer, then
    /// [`Context::dispatch`] it.
    pub fn incoming_req_create(self: &Arc<Self>, opc: Opcode) -> Result<RpcHandle> {
        rpc::create(self, Endpoint::new(self.instance.self_rank, 0), opc, true, true)
    }

    /// Allocate a collective request fanned out over `grp` minus
    /// `excluded` at send time.
    pub fn corpc_req_create(
        self: &Arc<Self>,
        grp: &Arc<Group>,
        excluded: &RankList,
        opc: Opcode,
        bulk: Option<BulkHandle>,
        priv_data: Option<Arc<dyn Any + Send + Sync>>,
        flags: CorpcFlags,
        topo: TreeTopo,
    ) -> Result<RpcHandle> {
        corpc::corpc_req_create(self, grp, excluded, opc, bulk, priv_data, flags, topo)
    }

    /// Invoke the registered handler for an incoming request.
    pub fn dispatch(&self, rpc: &RpcHandle) -> Result<()> {
        (rpc.opc_info().handler)(rpc)
    }

    /// Drive transport I/O. `Err(Error::TimedOut)` means no event within
    /// the interval.
    pub fn progress(&self, timeout_us: u64) -> Result<()> {
        self.transport.progress(self, timeout_us)
    }

    /// Upcall for transports: deliver the completion of `rpc`.
    pub fn deliver_completion(&self, rpc: &RpcHandle, status: Status) {
        rpc.complete(status);
    }

    pub(crate) fn track(&self, rpc: &RpcHandle) -> Tracked {
        let mut t = self.tracker.lock().unwrap();
        let max = t.max_inflight;
        let q = t.inflight.entry(rpc.endpoint().clone()).or_default();
        if q.len() < max {
            q.push(rpc.clone());
            Tracked::Inflight
        } else {
            t.waitq.push_back(rpc.clone());
            Tracked::Wait
        }
    }

    /// Remove `rpc` from whichever queue holds it, then promote waiters
    /// into freed slots. Promoted requests transition to ReqSent and go to
    /// the transport; a promotion send failure completes that request with
    /// the error.
    pub(crate) fn untrack(&self, rpc: &RpcHandle) {
        let mut promoted: Vec<RpcHandle> = Vec::new();
        {
            let mut t = self.tracker.lock().unwrap();
            let ep = rpc.endpoint().clone();
            let mut removed = false;
            if let Some(q) = t.inflight.get_mut(&ep) {
                if let Some(pos) = q.iter().position(|r| Arc::ptr_eq(r, rpc)) {
                    q.remove(pos);
                    removed = true;
                }
                if q.is_empty() {
                    t.inflight.remove(&ep);
                }
            }
            if !removed {
                if let Some(pos) = t.waitq.iter().position(|r| Arc::ptr_eq(r, rpc)) {
                    t.waitq.remove(pos);
                }
            }
            let max = t.max_inflight;
            let mut i = 0;
            while i < t.waitq.len() {
                let cand_ep = t.waitq[i].endpoint().clone();
                let used = t.inflight.get(&cand_ep).map_or(0, |q| q.len());
                if used < max {
                    let cand = t.waitq.remove(i).unwrap();
                    t.inflight.entry(cand_ep).or_default().push(cand.clone());
                    promoted.push(cand);
                } else {
                    i += 1;
                }
            }
        }
        for cand in promoted {
            cand.set_state(RpcState::ReqSent);
            if let Err(rc) = self.transport.req_send(&cand) {
                error!(
                    "promoted req_send failed, rc: {}, opc: 0x{:x}",
                    rc,
                    cand.opcode()
                );
                cand.complete(Err(rc));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_counts(&self) -> (usize, usize) {
        let t = self.tracker.lock().unwrap();
        (
            t.inflight.values().map(|q| q.len()).sum(),
            t.waitq.len(),
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        group::{Group, RankList},
        opcode::RequestFormat,
        rpc::Endpoint,
        transport::testing::MockTransport,
    };

    pub(crate) const OPC_PING: Opcode = 0x100;

    fn nop_handler(_rpc: &RpcHandle) -> Result<()> {
        Ok(())
    }

    pub(crate) fn test_instance(nranks: u32) -> Arc<Instance> {
        let members = RankList::new((0..nranks).collect());
        let inst = Instance::init(Arc::new(Group::new("primary", members)), 0).unwrap();
        inst.rpc_register(
            OPC_PING,
            "PING",
            1,
            RequestFormat::new(16, 16),
            nop_handler,
            None,
        )
        .unwrap();
        inst
    }

    #[test]
    fn inflight_bound_parks_excess_in_waitq() {
        let inst = test_instance(4);
        let mock = MockTransport::new();
        let ctx = inst.context_with_inflight(mock.clone(), 2);

        let mut reqs = Vec::new();
        for _ in 0..3 {
            let rpc = ctx.req_create(Endpoint::new(1, 0), OPC_PING).unwrap();
            rpc.addref();
            rpc.send(|_cb| {}).unwrap();
            reqs.push(rpc);
        }
        assert_eq!(mock.counters().sends, 2);
        assert_eq!(ctx.tracked_counts(), (2, 1));
        assert_eq!(reqs[2].state(), RpcState::Inited);

        // completing one in-flight request promotes the waiter
        ctx.deliver_completion(&reqs[0], Ok(()));
        assert_eq!(mock.counters().sends, 3);
        assert_eq!(ctx.tracked_counts(), (2, 0));
        assert_eq!(reqs[2].state(), RpcState::ReqSent);

        ctx.deliver_completion(&reqs[1], Ok(()));
        ctx.deliver_completion(&reqs[2], Ok(()));
        assert_eq!(ctx.tracked_counts(), (0, 0));
        mock.clear();
    }

    #[test]
    fn promotion_send_failure_completes_with_error() {
        let inst = test_instance(4);
        let mock = MockTransport::new();
        let ctx = inst.context_with_inflight(mock.clone(), 1);

        let first = ctx.req_create(Endpoint::new(2, 0), OPC_PING).unwrap();
        first.addref();
        first.send(|_cb| {}).unwrap();

        let waiter = ctx.req_create(Endpoint::new(2, 0), OPC_PING).unwrap();
        waiter.addref();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        waiter
            .send(move |cb| {
                *seen2.lock().unwrap() = Some(cb.status.clone());
            })
            .unwrap();
        assert_eq!(ctx.tracked_counts(), (1, 1));

        // the promotion attempt fails at the transport
        mock.fail_send_rank(2);
        ctx.deliver_completion(&first, Ok(()));
        assert_eq!(
            *seen.lock().unwrap(),
            Some(Err(Error::Transport(
                crate::transport::testing::MOCK_SEND_RC
            )))
        );
        assert_eq!(ctx.tracked_counts(), (0, 0));
        mock.clear();
    }

    #[test]
    fn queues_are_per_endpoint() {
        let inst = test_instance(4);
        let mock = MockTransport::new();
        let ctx = inst.context_with_inflight(mock.clone(), 1);

        for rank in 0..3 {
            let rpc = ctx.req_create(Endpoint::new(rank, 0), OPC_PING).unwrap();
            rpc.send(|_cb| {}).unwrap();
        }
        // one slot per endpoint, so all three go straight out
        assert_eq!(mock.counters().sends, 3);
        assert_eq!(ctx.tracked_counts(), (3, 0));
        mock.clear();
    }
}
