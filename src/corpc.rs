use crate::{
    context::Context,
    error::{Result, Status},
    group::{Group, RankList},
    opcode::Opcode,
    rpc::{self, Endpoint, RpcHandle},
    transport::CbInfo,
};
use bitflags::bitflags;
use log::{debug, error};
use std::{
    any::Any,
    sync::{Arc, Weak},
};

bitflags! {
    pub struct CorpcFlags: u32 {
        /// Destroy the target group once the collective completes
        /// successfully.
        const GRP_DESTROY = 0x1;
    }
}

/// Opaque bulk-transfer handle owned by the transport layer; the core
/// only carries it alongside a collective request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BulkHandle(pub u64);

/// Fan-out shape of a collective. Only the flat topology is implemented;
/// the descriptor is the extension point for tree fan-out policies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeTopo {
    Flat,
}

impl Default for TreeTopo {
    fn default() -> TreeTopo {
        TreeTopo::Flat
    }
}

/// Collective bookkeeping hung off a parent RPC. All counters and the
/// child list are guarded by the parent's per-RPC lock.
///
/// `child_count` is fixed at creation to the full group size; excluded
/// ranks are credited as acked at send time, so the parent completes
/// exactly when `child_ack == child_count`.
pub(crate) struct CorpcInfo {
    pub(crate) grp: Arc<Group>,
    pub(crate) excluded: RankList,
    pub(crate) priv_data: Option<Arc<dyn Any + Send + Sync>>,
    #[allow(dead_code)]
    pub(crate) topo: TreeTopo,
    pub(crate) flags: CorpcFlags,
    pub(crate) child_count: u32,
    pub(crate) child_ack: u32,
    /// Status of the last failing child observed; success if none failed.
    pub(crate) co_rc: Status,
    /// Outstanding children. Each entry holds one extra reference on its
    /// child until the child's completion unlinks it, and one on the
    /// parent so this bookkeeping outlives an early parent completion.
    pub(crate) children: Vec<RpcHandle>,
    /// Back-reference for tree topologies; `None` at the fan-out root.
    #[allow(dead_code)]
    pub(crate) parent: Option<Weak<rpc::Rpc>>,
}

pub(crate) fn corpc_req_create(
    ctx: &Arc<Context>,
    grp: &Arc<Group>,
    excluded: &RankList,
    opc: Opcode,
    bulk: Option<BulkHandle>,
    priv_data: Option<Arc<dyn Any + Send + Sync>>,
    flags: CorpcFlags,
    topo: TreeTopo,
) -> Result<RpcHandle> {
    let ep = Endpoint {
        grp_id: Some(grp.id().to_string()),
        rank: 0,
        tag: 0,
    };
    // the parent itself never goes to the transport, only its children do
    let parent = rpc::create(ctx, ep, opc, false, false)?;
    let mut excl = excluded.dup();
    excl.sort();
    {
        let mut g = parent.inner.lock();
        g.co_bulk = bulk;
        g.corpc = Some(Box::new(CorpcInfo {
            grp: grp.clone(),
            excluded: excl,
            priv_data,
            topo,
            flags,
            child_count: grp.size(),
            child_ack: 0,
            co_rc: Ok(()),
            children: Vec::new(),
            parent: None,
        }));
    }
    Ok(parent)
}

fn corpc_add_child(parent: &RpcHandle, child: &RpcHandle) {
    child.addref();
    parent.addref();
    let mut g = parent.inner.lock();
    let co = g.corpc.as_mut().unwrap();
    co.children.push(child.clone());
}

fn corpc_del_child(parent: &RpcHandle, child: &RpcHandle) {
    let removed = {
        let mut g = parent.inner.lock();
        let co = g.corpc.as_mut().unwrap();
        let before = co.children.len();
        co.children.retain(|c| !Arc::ptr_eq(c, child));
        co.children.len() != before
    };
    if removed {
        // drops the references taken in corpc_add_child
        child.decref();
        parent.decref();
    } else {
        debug!("child opc 0x{:x} not on the parent's list", child.opcode());
    }
}

/// Complete a collective parent, honoring the GRP_DESTROY flag on
/// success. A parent that already completed and tore its collective
/// state down falls through to the at-most-once guard in `complete`.
fn corpc_complete_parent(parent: &RpcHandle, status: Status) {
    if status.is_ok() {
        let destroy_grp = {
            let g = parent.inner.lock();
            g.corpc.as_ref().and_then(|co| {
                if co.flags.contains(CorpcFlags::GRP_DESTROY) {
                    Some(co.grp.id().to_string())
                } else {
                    None
                }
            })
        };
        if let Some(grp_id) = destroy_grp {
            debug!("collective done, destroying group {}", grp_id);
            parent.context().instance().groups().remove(&grp_id);
        }
    }
    parent.complete(status);
}

/// Per-child completion callback. Under the parent lock: fold the child
/// status into `co_rc`, bump the ack count and run the user aggregation
/// (also for failed children, so per-rank failures can be recorded;
/// aggregation failures are logged and do not change the outcome). The
/// child is unlinked outside the lock, and the ack that reaches
/// `child_count` completes the parent.
pub(crate) fn corpc_child_cb(parent: &RpcHandle, cb_info: &CbInfo<'_>) {
    let child = cb_info.rpc;
    debug_assert_eq!(parent.opcode(), child.opcode());
    let (done, co_rc) = {
        let mut g = parent.inner.lock();
        let co = g.corpc.as_mut().unwrap();
        if let Err(rc) = &cb_info.status {
            error!("child rpc (opc: 0x{:x}) failed, rc: {}", child.opcode(), rc);
            co.co_rc = Err(rc.clone());
        }
        co.child_ack += 1;
        debug_assert!(co.child_ack <= co.child_count);
        let done = co.child_ack == co.child_count;
        let priv_data = co.priv_data.clone();
        if let Some(co_ops) = &parent.opc_info().co_ops {
            if let Err(rc) = (co_ops.aggregate)(child, parent, priv_data.as_deref()) {
                error!(
                    "aggregate failed, rc: {}, opc: 0x{:x}",
                    rc,
                    child.opcode()
                );
            }
        }
        (done, g.corpc.as_ref().unwrap().co_rc.clone())
    };
    corpc_del_child(parent, child);
    if done {
        corpc_complete_parent(parent, co_rc);
    }
}

/// Fan the parent out: one child per group member, in membership order,
/// skipping (and crediting) excluded ranks. A child create/send failure
/// stops the fan-out and completes the parent right away with the error,
/// after crediting all not-yet-issued children; already-sent children are
/// left to finish on their own, their late completions stopping at the
/// parent's at-most-once guard.
pub(crate) fn corpc_send(parent: &RpcHandle) -> Result<()> {
    let (members, excluded, child_count) = {
        let g = parent.inner.lock();
        let co = g.corpc.as_ref().unwrap();
        (co.grp.members().dup(), co.excluded.dup(), co.child_count)
    };
    debug_assert_eq!(child_count as usize, members.len());
    let ctx = parent.context().clone();

    let mut rc: Status = Ok(());
    let mut child_sent = false;
    for (i, &rank) in members.as_slice().iter().enumerate() {
        if excluded.contains(rank) {
            debug!("rank {} in excluded list, ignored", rank);
            let mut g = parent.inner.lock();
            g.corpc.as_mut().unwrap().child_ack += 1;
            continue;
        }
        let child = match ctx.req_create(Endpoint::new(rank, 0), parent.opcode()) {
            Ok(child) => child,
            Err(e) => {
                error!(
                    "child req_create (opc: 0x{:x}) failed, tgt rank: {}, rc: {}",
                    parent.opcode(),
                    rank,
                    e
                );
                let mut g = parent.inner.lock();
                let co = g.corpc.as_mut().unwrap();
                co.child_ack += child_count - i as u32;
                co.co_rc = Err(e.clone());
                rc = Err(e);
                break;
            }
        };
        {
            let src = parent.input();
            let mut dst = child.input();
            debug_assert_eq!(src.len(), dst.len());
            dst.copy_from_slice(&src);
        }
        // linked before the send so a completion on another thread always
        // finds the child on the list
        corpc_add_child(parent, &child);
        let parent2 = parent.clone();
        if let Err(e) = child.send(move |cb_info| corpc_child_cb(&parent2, cb_info)) {
            error!(
                "child req_send (opc: 0x{:x}) failed, tgt rank: {}, rc: {}",
                parent.opcode(),
                rank,
                e
            );
            corpc_del_child(parent, &child);
            let mut g = parent.inner.lock();
            let co = g.corpc.as_mut().unwrap();
            co.child_ack += child_count - i as u32;
            co.co_rc = Err(e.clone());
            rc = Err(e);
            break;
        }
        child_sent = true;
    }

    // collective state may already be gone if a racing callback finished
    // the parent during the loop
    let (done, co_rc) = {
        let g = parent.inner.lock();
        match g.corpc.as_ref() {
            Some(co) => (co.child_ack == co.child_count, co.co_rc.clone()),
            None => (false, Ok(())),
        }
    };
    if rc.is_err() || !child_sent {
        // the fan-out stopped early (or never got anything out): the
        // caller's reference is consumed and its callback runs now, with
        // the error for a failed fan-out and success when everyone was
        // excluded
        parent.addref();
        corpc_complete_parent(parent, co_rc);
        parent.decref();
        return rc;
    }
    if done {
        // the callbacks beat us to the last ack
        corpc_complete_parent(parent, co_rc);
    }
    rc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::tests::test_instance,
        context::Instance,
        error::Error,
        group::Rank,
        opcode::{CorpcOps, OpcInfo, RequestFormat},
        transport::testing::{MockTransport, MOCK_CREATE_RC, MOCK_SEND_RC},
    };
    use std::sync::Mutex;

    const OPC_ECHO: Opcode = 0x200;

    fn nop_handler(_rpc: &RpcHandle) -> Result<()> {
        Ok(())
    }

    /// Counts aggregate invocations; the priv data is the counter itself.
    fn counting_aggregate(
        _child: &RpcHandle,
        _parent: &RpcHandle,
        priv_data: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<()> {
        let hits = priv_data
            .and_then(|p| p.downcast_ref::<Mutex<u32>>())
            .expect("aggregate priv data");
        *hits.lock().unwrap() += 1;
        Ok(())
    }

    fn echo_instance(nranks: u32) -> Arc<Instance> {
        let inst = test_instance(nranks);
        inst.registry()
            .register(OpcInfo {
                opc: OPC_ECHO,
                name: "ECHO",
                version: 1,
                flags: 0,
                format: RequestFormat::new(32, 32),
                handler: nop_handler,
                co_ops: Some(CorpcOps {
                    aggregate: counting_aggregate,
                }),
            })
            .unwrap();
        inst
    }

    struct Fixture {
        inst: Arc<Instance>,
        mock: Arc<MockTransport>,
        ctx: Arc<Context>,
        agg_hits: Arc<Mutex<u32>>,
        parent_status: Arc<Mutex<Vec<Status>>>,
    }

    fn fixture(nranks: u32) -> Fixture {
        let inst = echo_instance(nranks);
        let mock = MockTransport::new();
        let ctx = inst.context(mock.clone());
        Fixture {
            inst,
            mock,
            ctx,
            agg_hits: Arc::new(Mutex::new(0)),
            parent_status: Arc::new(Mutex::new(Vec::new())),
        }
    }

    impl Fixture {
        fn corpc(&self, excluded: &[Rank]) -> RpcHandle {
            let parent = self
                .ctx
                .corpc_req_create(
                    self.inst.primary_group(),
                    &RankList::new(excluded.to_vec()),
                    OPC_ECHO,
                    None,
                    Some(self.agg_hits.clone() as Arc<dyn Any + Send + Sync>),
                    CorpcFlags::empty(),
                    TreeTopo::default(),
                )
                .unwrap();
            parent.addref();
            parent
        }

        fn send(&self, parent: &RpcHandle) -> Result<()> {
            let statuses = self.parent_status.clone();
            parent.send(move |cb| {
                statuses.lock().unwrap().push(cb.status.clone());
            })
        }

        fn child_ack(&self, parent: &RpcHandle) -> u32 {
            let g = parent.inner.lock();
            g.corpc.as_ref().unwrap().child_ack
        }

        fn children_len(&self, parent: &RpcHandle) -> usize {
            let g = parent.inner.lock();
            g.corpc.as_ref().unwrap().children.len()
        }
    }

    #[test]
    fn fan_out_skips_and_credits_excluded_ranks() {
        let f = fixture(5);
        let parent = f.corpc(&[1, 3]);
        {
            let mut input = parent.input();
            input[..4].copy_from_slice(b"ping");
        }
        f.send(&parent).unwrap();

        let sent = f.mock.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent.iter().map(|c| c.endpoint().rank).collect::<Vec<_>>(),
            vec![0, 2, 4]
        );
        // parent input copied verbatim into each child
        for child in &sent {
            assert_eq!(&child.input()[..4], b"ping");
        }

        // completions in arbitrary order
        f.ctx.deliver_completion(&sent[2], Ok(()));
        f.ctx.deliver_completion(&sent[0], Ok(()));
        assert!(f.parent_status.lock().unwrap().is_empty());
        f.ctx.deliver_completion(&sent[1], Ok(()));

        assert_eq!(f.child_ack(&parent), 5);
        assert_eq!(*f.parent_status.lock().unwrap(), vec![Ok(())]);
        assert_eq!(*f.agg_hits.lock().unwrap(), 3);
        assert_eq!(f.children_len(&parent), 0);
        f.mock.clear();
        // every child destroyed once its list reference and send
        // reference are gone
        assert_eq!(f.mock.counters().destroys, 3);
        parent.decref();
    }

    #[test]
    fn child_send_failure_completes_the_parent_with_the_error() {
        let f = fixture(4);
        f.mock.fail_send_rank(2);
        let parent = f.corpc(&[]);
        let err = f.send(&parent).unwrap_err();
        assert_eq!(err, Error::Transport(MOCK_SEND_RC));

        // ranks 0 and 1 went out before the failure at rank 2; the
        // remaining children were credited and the parent completed
        // before send returned
        let sent = f.mock.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(f.child_ack(&parent), 2);
        assert_eq!(
            *f.parent_status.lock().unwrap(),
            vec![Err(Error::Transport(MOCK_SEND_RC))]
        );

        // the in-flight children still finish: they ack and unlink but
        // cannot complete the parent a second time
        f.ctx.deliver_completion(&sent[0], Ok(()));
        f.ctx.deliver_completion(&sent[1], Ok(()));
        assert_eq!(f.child_ack(&parent), 4);
        assert_eq!(f.parent_status.lock().unwrap().len(), 1);
        assert_eq!(f.children_len(&parent), 0);
        parent.decref();
        f.mock.clear();
    }

    #[test]
    fn child_create_failure_completes_the_parent_with_the_error() {
        let f = fixture(4);
        f.mock.fail_create_rank(1);
        let parent = f.corpc(&[]);
        let err = f.send(&parent).unwrap_err();
        assert_eq!(err, Error::Transport(MOCK_CREATE_RC));

        let sent = f.mock.sent();
        assert_eq!(sent.len(), 1);
        // ranks 1..3 pre-credited; rank 0 is still in flight
        assert_eq!(f.child_ack(&parent), 3);
        assert_eq!(
            *f.parent_status.lock().unwrap(),
            vec![Err(Error::Transport(MOCK_CREATE_RC))]
        );

        f.ctx.deliver_completion(&sent[0], Ok(()));
        assert_eq!(f.child_ack(&parent), 4);
        assert_eq!(f.parent_status.lock().unwrap().len(), 1);
        assert_eq!(f.children_len(&parent), 0);
        parent.decref();
        f.mock.clear();
    }

    #[test]
    fn total_fan_out_failure_completes_inline_with_the_error() {
        let f = fixture(3);
        f.mock.fail_send_rank(0);
        let parent = f.corpc(&[]);
        let err = f.send(&parent).unwrap_err();
        assert_eq!(err, Error::Transport(MOCK_SEND_RC));
        assert_eq!(f.mock.sent().len(), 0);
        assert_eq!(f.child_ack(&parent), 3);
        assert_eq!(
            *f.parent_status.lock().unwrap(),
            vec![Err(Error::Transport(MOCK_SEND_RC))]
        );
        // inline completion consumed the caller-transferred reference
        assert_eq!(parent.refcount(), 1);
        parent.decref();
    }

    #[test]
    fn all_ranks_excluded_completes_immediately() {
        let f = fixture(3);
        let parent = f.corpc(&[0, 1, 2]);
        f.send(&parent).unwrap();
        assert_eq!(f.mock.counters().sends, 0);
        assert_eq!(f.child_ack(&parent), 3);
        assert_eq!(*f.parent_status.lock().unwrap(), vec![Ok(())]);
        // excluded ranks never reach the aggregate
        assert_eq!(*f.agg_hits.lock().unwrap(), 0);
        parent.decref();
    }

    #[test]
    fn failed_child_status_wins_and_still_aggregates() {
        let f = fixture(3);
        let parent = f.corpc(&[]);
        f.send(&parent).unwrap();
        let sent = f.mock.sent();
        f.ctx.deliver_completion(&sent[0], Ok(()));
        f.ctx
            .deliver_completion(&sent[1], Err(Error::Transport(-17)));
        f.ctx.deliver_completion(&sent[2], Ok(()));
        assert_eq!(
            *f.parent_status.lock().unwrap(),
            vec![Err(Error::Transport(-17))]
        );
        // aggregate ran for the failed child too
        assert_eq!(*f.agg_hits.lock().unwrap(), 3);
        parent.decref();
        f.mock.clear();
    }

    #[test]
    fn parent_completes_exactly_once_under_duplicate_acks() {
        let f = fixture(2);
        let parent = f.corpc(&[]);
        f.send(&parent).unwrap();
        let sent = f.mock.sent();
        f.ctx.deliver_completion(&sent[0], Ok(()));
        f.ctx.deliver_completion(&sent[1], Ok(()));
        // duplicate deliveries are swallowed by the children's own
        // completion guards, so the ack count stays put
        f.ctx.deliver_completion(&sent[0], Ok(()));
        f.ctx.deliver_completion(&sent[1], Err(Error::Transport(-3)));
        assert_eq!(f.child_ack(&parent), 2);
        assert_eq!(*f.parent_status.lock().unwrap(), vec![Ok(())]);
        parent.decref();
        f.mock.clear();
    }

    #[test]
    fn grp_destroy_flag_removes_the_group_on_success() {
        let f = fixture(2);
        let sub = Arc::new(Group::new("sub", RankList::new(vec![0, 1])));
        f.inst.groups().insert(sub.clone()).unwrap();
        let parent = f
            .ctx
            .corpc_req_create(
                &sub,
                &RankList::default(),
                OPC_ECHO,
                None,
                None,
                CorpcFlags::GRP_DESTROY,
                TreeTopo::default(),
            )
            .unwrap();
        parent.addref();
        f.send(&parent).unwrap();
        for child in f.mock.sent() {
            f.ctx.deliver_completion(&child, Ok(()));
        }
        assert_eq!(*f.parent_status.lock().unwrap(), vec![Ok(())]);
        assert!(f.inst.groups().lookup("sub").is_none());
        parent.decref();
        f.mock.clear();
    }
}
