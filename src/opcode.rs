use crate::{
    error::{Error, Result},
    group,
    rpc::RpcHandle,
};
use log::{debug, error};
use std::{any::Any, collections::HashMap, sync::Arc, sync::RwLock};

pub type Opcode = u32;

/// Upper bounds on per-request buffer sizes, enforced at registration.
pub const MAX_INPUT_SIZE: usize = 1 << 20;
pub const MAX_OUTPUT_SIZE: usize = 1 << 20;

/// Opcodes reserved for the internal RPC table.
pub const OPC_INTERNAL_BASE: Opcode = 0xFFF0_0000;
pub const OPC_GRP_CREATE: Opcode = OPC_INTERNAL_BASE | 0x1;
pub const OPC_GRP_DESTROY: Opcode = OPC_INTERNAL_BASE | 0x2;
pub const OPC_URI_LOOKUP: Opcode = OPC_INTERNAL_BASE | 0x3;

/// Request handler invoked when an incoming RPC of the matching opcode is
/// dispatched. The handler owns filling the output buffer and replying.
pub type Handler = fn(&RpcHandle) -> Result<()>;

/// Per-child aggregation callback for collective RPCs. Called once per
/// child completion (successful or failed) with the child, the parent and
/// the private data supplied at corpc creation.
///
/// Aggregators run under the parent's lock and must not call back into the
/// RPC API on the same parent.
pub type AggregateFn =
    fn(child: &RpcHandle, parent: &RpcHandle, priv_data: Option<&(dyn Any + Send + Sync)>) -> Result<()>;

#[derive(Clone, Copy)]
pub struct CorpcOps {
    pub aggregate: AggregateFn,
}

/// Sizes of the opcode's input and output buffers. The wire layout of the
/// fields inside those buffers is the registrant's business.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestFormat {
    pub input_size: usize,
    pub output_size: usize,
}

impl RequestFormat {
    pub const fn new(input_size: usize, output_size: usize) -> RequestFormat {
        RequestFormat {
            input_size,
            output_size,
        }
    }
}

/// One registered opcode. Immutable once registered.
pub struct OpcInfo {
    pub opc: Opcode,
    pub name: &'static str,
    pub version: u32,
    pub flags: u32,
    pub format: RequestFormat,
    pub handler: Handler,
    pub co_ops: Option<CorpcOps>,
}

/// Opcode -> descriptor map. Populated from the internal table at init;
/// extensions may register afterwards but never collide. Handlers are fn
/// pointers, so the non-null handler invariant holds by construction.
pub struct OpcodeRegistry {
    map: RwLock<HashMap<Opcode, Arc<OpcInfo>>>,
}

impl OpcodeRegistry {
    pub fn new() -> OpcodeRegistry {
        OpcodeRegistry {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, info: OpcInfo) -> Result<()> {
        if info.format.input_size > MAX_INPUT_SIZE || info.format.output_size > MAX_OUTPUT_SIZE {
            error!(
                "opc 0x{:x}: format too large (in: {}, out: {})",
                info.opc, info.format.input_size, info.format.output_size
            );
            return Err(Error::Inval);
        }
        let mut map = self.map.write().unwrap();
        if map.contains_key(&info.opc) {
            error!("opc 0x{:x} already registered", info.opc);
            return Err(Error::Inval);
        }
        debug!("registered opc 0x{:x} ({})", info.opc, info.name);
        map.insert(info.opc, Arc::new(info));
        Ok(())
    }

    pub fn lookup(&self, opc: Opcode) -> Option<Arc<OpcInfo>> {
        self.map.read().unwrap().get(&opc).cloned()
    }
}

impl Default for OpcodeRegistry {
    fn default() -> OpcodeRegistry {
        OpcodeRegistry::new()
    }
}

struct InternalRpc {
    name: &'static str,
    opc: Opcode,
    version: u32,
    flags: u32,
    format: RequestFormat,
    handler: Handler,
    co_ops: Option<CorpcOps>,
}

static INTERNAL_RPCS: [InternalRpc; 3] = [
    InternalRpc {
        name: "CRT_GRP_CREATE",
        opc: OPC_GRP_CREATE,
        version: 1,
        flags: 0,
        format: RequestFormat::new(group::GRP_CREATE_IN_SIZE, group::GRP_CREATE_OUT_SIZE),
        handler: group::grp_create_handler,
        co_ops: None,
    },
    InternalRpc {
        name: "CRT_GRP_DESTROY",
        opc: OPC_GRP_DESTROY,
        version: 1,
        flags: 0,
        format: RequestFormat::new(group::GRP_DESTROY_IN_SIZE, group::GRP_DESTROY_OUT_SIZE),
        handler: group::grp_destroy_handler,
        co_ops: None,
    },
    InternalRpc {
        name: "CRT_URI_LOOKUP",
        opc: OPC_URI_LOOKUP,
        version: 1,
        flags: 0,
        format: RequestFormat::new(group::URI_LOOKUP_IN_SIZE, group::URI_LOOKUP_OUT_SIZE),
        handler: group::uri_lookup_handler,
        co_ops: None,
    },
];

/// Walk the internal table and register each RPC, stopping at the first
/// failure.
pub(crate) fn register_internal(registry: &OpcodeRegistry) -> Result<()> {
    for rpc in INTERNAL_RPCS.iter() {
        if let Err(rc) = registry.register(OpcInfo {
            opc: rpc.opc,
            name: rpc.name,
            version: rpc.version,
            flags: rpc.flags,
            format: rpc.format,
            handler: rpc.handler,
            co_ops: rpc.co_ops,
        }) {
            error!("opcode 0x{:x} registration failed, rc: {}", rpc.opc, rc);
            return Err(rc);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_handler(_rpc: &RpcHandle) -> Result<()> {
        Ok(())
    }

    fn info(opc: Opcode, format: RequestFormat) -> OpcInfo {
        OpcInfo {
            opc,
            name: "TEST",
            version: 1,
            flags: 0,
            format,
            handler: nop_handler,
            co_ops: None,
        }
    }

    #[test]
    fn register_then_lookup() {
        let reg = OpcodeRegistry::new();
        reg.register(info(0x10, RequestFormat::new(16, 32))).unwrap();
        let found = reg.lookup(0x10).unwrap();
        assert_eq!(found.format, RequestFormat::new(16, 32));
        assert!(reg.lookup(0x11).is_none());
    }

    #[test]
    fn duplicate_opcode_rejected() {
        let reg = OpcodeRegistry::new();
        reg.register(info(0x10, RequestFormat::new(0, 0))).unwrap();
        assert_eq!(
            reg.register(info(0x10, RequestFormat::new(0, 0))),
            Err(Error::Inval)
        );
    }

    #[test]
    fn oversized_format_rejected() {
        let reg = OpcodeRegistry::new();
        assert_eq!(
            reg.register(info(0x10, RequestFormat::new(MAX_INPUT_SIZE + 1, 0))),
            Err(Error::Inval)
        );
        assert_eq!(
            reg.register(info(0x10, RequestFormat::new(0, MAX_OUTPUT_SIZE + 1))),
            Err(Error::Inval)
        );
    }

    #[test]
    fn internal_table_registers_once() {
        let reg = OpcodeRegistry::new();
        register_internal(&reg).unwrap();
        for opc in &[OPC_GRP_CREATE, OPC_GRP_DESTROY, OPC_URI_LOOKUP] {
            let found = reg.lookup(*opc).unwrap();
            assert_eq!(found.version, 1);
            assert!(found.co_ops.is_none());
        }
        // second init would collide
        assert!(register_internal(&reg).is_err());
    }
}
