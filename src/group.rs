use crate::{
    error::{Error, Result},
    opcode::{MAX_INPUT_SIZE, MAX_OUTPUT_SIZE},
    rpc::RpcHandle,
};
use log::{debug, error};
use static_assertions::const_assert;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

pub type Rank = u32;
pub type GroupId = String;

/// A list of ranks. Sortedness is tracked so membership tests can use a
/// binary search on sorted lists (excluded sets are always sorted).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RankList {
    ranks: Vec<Rank>,
    sorted: bool,
}

impl RankList {
    pub fn new(ranks: Vec<Rank>) -> RankList {
        let sorted = ranks.windows(2).all(|w| w[0] <= w[1]);
        RankList { ranks, sorted }
    }

    pub fn dup(&self) -> RankList {
        self.clone()
    }

    pub fn sort(&mut self) {
        self.ranks.sort_unstable();
        self.sorted = true;
    }

    pub fn contains(&self, rank: Rank) -> bool {
        if self.sorted {
            self.ranks.binary_search(&rank).is_ok()
        } else {
            self.ranks.contains(&rank)
        }
    }

    pub fn push(&mut self, rank: Rank) {
        if let Some(&last) = self.ranks.last() {
            self.sorted = self.sorted && last <= rank;
        } else {
            self.sorted = true;
        }
        self.ranks.push(rank);
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn as_slice(&self) -> &[Rank] {
        &self.ranks
    }
}

/// A named set of ranks plus the rank directory (rank -> URI) used by
/// URI_LOOKUP. Members are kept sorted.
pub struct Group {
    id: GroupId,
    members: RankList,
    uris: Mutex<HashMap<Rank, String>>,
}

impl Group {
    pub fn new(id: impl Into<GroupId>, mut members: RankList) -> Group {
        members.sort();
        Group {
            id: id.into(),
            members,
            uris: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> u32 {
        self.members.len() as u32
    }

    pub fn members(&self) -> &RankList {
        &self.members
    }

    pub fn set_uri(&self, rank: Rank, uri: impl Into<String>) {
        self.uris.lock().unwrap().insert(rank, uri.into());
    }

    pub fn uri(&self, rank: Rank) -> Option<String> {
        self.uris.lock().unwrap().get(&rank).cloned()
    }
}

/// Process-wide registry of known groups, keyed by group id.
pub struct GroupDirectory {
    groups: Mutex<HashMap<GroupId, Arc<Group>>>,
}

impl GroupDirectory {
    pub fn new() -> GroupDirectory {
        GroupDirectory {
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, grp: Arc<Group>) -> Result<()> {
        let mut groups = self.groups.lock().unwrap();
        if groups.contains_key(grp.id()) {
            error!("group {} already known", grp.id());
            return Err(Error::Inval);
        }
        groups.insert(grp.id().to_string(), grp);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Group>> {
        self.groups.lock().unwrap().remove(id)
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Group>> {
        self.groups.lock().unwrap().get(id).cloned()
    }
}

impl Default for GroupDirectory {
    fn default() -> GroupDirectory {
        GroupDirectory::new()
    }
}

/* Builtin RPC messages.
 *
 * Fields are laid out at fixed offsets inside the opcode's buffer so the
 * buffer sizes are compile-time constants; variable-length fields carry a
 * u16 length prefix inside a fixed-capacity slot. Everything is
 * little-endian.
 */

pub const GRP_ID_MAX: usize = 64;
pub const URI_MAX: usize = 128;
pub const WIRE_RANKS_MAX: usize = 254;

const ID_FIELD_SIZE: usize = 2 + GRP_ID_MAX;
const RANKS_FIELD_SIZE: usize = 2 + 4 * WIRE_RANKS_MAX;
const URI_FIELD_SIZE: usize = 2 + URI_MAX;
const RANK_FIELD_SIZE: usize = 4;
const RC_FIELD_SIZE: usize = 4;

pub const GRP_CREATE_IN_SIZE: usize = ID_FIELD_SIZE + RANKS_FIELD_SIZE + RANK_FIELD_SIZE;
pub const GRP_CREATE_OUT_SIZE: usize = RANKS_FIELD_SIZE + RANK_FIELD_SIZE + RC_FIELD_SIZE;
pub const GRP_DESTROY_IN_SIZE: usize = ID_FIELD_SIZE + RANK_FIELD_SIZE;
pub const GRP_DESTROY_OUT_SIZE: usize = RANKS_FIELD_SIZE + RANK_FIELD_SIZE + RC_FIELD_SIZE;
pub const URI_LOOKUP_IN_SIZE: usize = ID_FIELD_SIZE + RANK_FIELD_SIZE;
pub const URI_LOOKUP_OUT_SIZE: usize = URI_FIELD_SIZE + RC_FIELD_SIZE;

const_assert!(GRP_CREATE_IN_SIZE <= MAX_INPUT_SIZE);
const_assert!(GRP_CREATE_OUT_SIZE <= MAX_OUTPUT_SIZE);
const_assert!(GRP_DESTROY_IN_SIZE <= MAX_INPUT_SIZE);
const_assert!(GRP_DESTROY_OUT_SIZE <= MAX_OUTPUT_SIZE);
const_assert!(URI_LOOKUP_IN_SIZE <= MAX_INPUT_SIZE);
const_assert!(URI_LOOKUP_OUT_SIZE <= MAX_OUTPUT_SIZE);

struct Enc<'a> {
    buf: &'a mut [u8],
    off: usize,
}

impl<'a> Enc<'a> {
    fn new(buf: &'a mut [u8]) -> Enc<'a> {
        Enc { buf, off: 0 }
    }

    fn u16(&mut self, v: u16) -> Result<()> {
        if self.off + 2 > self.buf.len() {
            return Err(Error::Inval);
        }
        self.buf[self.off..self.off + 2].copy_from_slice(&v.to_le_bytes());
        self.off += 2;
        Ok(())
    }

    fn u32(&mut self, v: u32) -> Result<()> {
        if self.off + 4 > self.buf.len() {
            return Err(Error::Inval);
        }
        self.buf[self.off..self.off + 4].copy_from_slice(&v.to_le_bytes());
        self.off += 4;
        Ok(())
    }

    fn i32(&mut self, v: i32) -> Result<()> {
        self.u32(v as u32)
    }

    fn str_field(&mut self, s: &str, cap: usize) -> Result<()> {
        if s.len() > cap {
            error!("string field of {} bytes exceeds capacity {}", s.len(), cap);
            return Err(Error::Inval);
        }
        let start = self.off;
        self.u16(s.len() as u16)?;
        if start + 2 + cap > self.buf.len() {
            return Err(Error::Inval);
        }
        self.buf[self.off..self.off + s.len()].copy_from_slice(s.as_bytes());
        self.off = start + 2 + cap;
        Ok(())
    }

    fn ranks_field(&mut self, ranks: &RankList, cap: usize) -> Result<()> {
        if ranks.len() > cap {
            error!("rank list of {} entries exceeds capacity {}", ranks.len(), cap);
            return Err(Error::Inval);
        }
        let start = self.off;
        self.u16(ranks.len() as u16)?;
        if start + 2 + 4 * cap > self.buf.len() {
            return Err(Error::Inval);
        }
        for &r in ranks.as_slice() {
            self.buf[self.off..self.off + 4].copy_from_slice(&r.to_le_bytes());
            self.off += 4;
        }
        self.off = start + 2 + 4 * cap;
        Ok(())
    }
}

struct Dec<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Dec<'a> {
    fn new(buf: &'a [u8]) -> Dec<'a> {
        Dec { buf, off: 0 }
    }

    fn u16(&mut self) -> Result<u16> {
        if self.off + 2 > self.buf.len() {
            return Err(Error::Inval);
        }
        let mut b = [0u8; 2];
        b.copy_from_slice(&self.buf[self.off..self.off + 2]);
        self.off += 2;
        Ok(u16::from_le_bytes(b))
    }

    fn u32(&mut self) -> Result<u32> {
        if self.off + 4 > self.buf.len() {
            return Err(Error::Inval);
        }
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.buf[self.off..self.off + 4]);
        self.off += 4;
        Ok(u32::from_le_bytes(b))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn str_field(&mut self, cap: usize) -> Result<String> {
        let start = self.off;
        let len = self.u16()? as usize;
        if len > cap || start + 2 + cap > self.buf.len() {
            return Err(Error::Inval);
        }
        let s = String::from_utf8(self.buf[self.off..self.off + len].to_vec())
            .map_err(|_| Error::Inval)?;
        self.off = start + 2 + cap;
        Ok(s)
    }

    fn ranks_field(&mut self, cap: usize) -> Result<RankList> {
        let start = self.off;
        let n = self.u16()? as usize;
        if n > cap || start + 2 + 4 * cap > self.buf.len() {
            return Err(Error::Inval);
        }
        let mut ranks = Vec::with_capacity(n);
        for _ in 0..n {
            let mut b = [0u8; 4];
            b.copy_from_slice(&self.buf[self.off..self.off + 4]);
            ranks.push(u32::from_le_bytes(b));
            self.off += 4;
        }
        self.off = start + 2 + 4 * cap;
        Ok(RankList::new(ranks))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrpCreateIn {
    pub grp_id: GroupId,
    pub members: RankList,
    pub initiate_rank: Rank,
}

impl GrpCreateIn {
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let mut e = Enc::new(buf);
        e.str_field(&self.grp_id, GRP_ID_MAX)?;
        e.ranks_field(&self.members, WIRE_RANKS_MAX)?;
        e.u32(self.initiate_rank)
    }

    pub fn decode(buf: &[u8]) -> Result<GrpCreateIn> {
        let mut d = Dec::new(buf);
        Ok(GrpCreateIn {
            grp_id: d.str_field(GRP_ID_MAX)?,
            members: d.ranks_field(WIRE_RANKS_MAX)?,
            initiate_rank: d.u32()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrpCreateOut {
    pub failed_ranks: RankList,
    pub rank: Rank,
    pub rc: i32,
}

impl GrpCreateOut {
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let mut e = Enc::new(buf);
        e.ranks_field(&self.failed_ranks, WIRE_RANKS_MAX)?;
        e.u32(self.rank)?;
        e.i32(self.rc)
    }

    pub fn decode(buf: &[u8]) -> Result<GrpCreateOut> {
        let mut d = Dec::new(buf);
        Ok(GrpCreateOut {
            failed_ranks: d.ranks_field(WIRE_RANKS_MAX)?,
            rank: d.u32()?,
            rc: d.i32()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrpDestroyIn {
    pub grp_id: GroupId,
    pub initiate_rank: Rank,
}

impl GrpDestroyIn {
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let mut e = Enc::new(buf);
        e.str_field(&self.grp_id, GRP_ID_MAX)?;
        e.u32(self.initiate_rank)
    }

    pub fn decode(buf: &[u8]) -> Result<GrpDestroyIn> {
        let mut d = Dec::new(buf);
        Ok(GrpDestroyIn {
            grp_id: d.str_field(GRP_ID_MAX)?,
            initiate_rank: d.u32()?,
        })
    }
}

pub type GrpDestroyOut = GrpCreateOut;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UriLookupIn {
    pub grp_id: GroupId,
    pub rank: Rank,
}

impl UriLookupIn {
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let mut e = Enc::new(buf);
        e.str_field(&self.grp_id, GRP_ID_MAX)?;
        e.u32(self.rank)
    }

    pub fn decode(buf: &[u8]) -> Result<UriLookupIn> {
        let mut d = Dec::new(buf);
        Ok(UriLookupIn {
            grp_id: d.str_field(GRP_ID_MAX)?,
            rank: d.u32()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UriLookupOut {
    pub uri: String,
    pub rc: i32,
}

impl UriLookupOut {
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let mut e = Enc::new(buf);
        e.str_field(&self.uri, URI_MAX)?;
        e.i32(self.rc)
    }

    pub fn decode(buf: &[u8]) -> Result<UriLookupOut> {
        let mut d = Dec::new(buf);
        Ok(UriLookupOut {
            uri: d.str_field(URI_MAX)?,
            rc: d.i32()?,
        })
    }
}

/* Builtin opcode handlers. Each decodes its input, updates the group
 * directory, encodes the reply and sends it. */

pub(crate) fn grp_create_handler(rpc: &RpcHandle) -> Result<()> {
    let msg = GrpCreateIn::decode(&rpc.input())?;
    let inst = rpc.context().instance();
    debug!("creating group {} ({} members)", msg.grp_id, msg.members.len());
    let rc = match inst
        .groups()
        .insert(Arc::new(Group::new(msg.grp_id.clone(), msg.members.dup())))
    {
        Ok(()) => 0,
        Err(e) => e.code(),
    };
    let out = GrpCreateOut {
        failed_ranks: RankList::default(),
        rank: inst.self_rank(),
        rc,
    };
    {
        let mut buf = rpc.output();
        out.encode(buf.as_mut_slice())?;
    }
    rpc.reply_send()
}

pub(crate) fn grp_destroy_handler(rpc: &RpcHandle) -> Result<()> {
    let msg = GrpDestroyIn::decode(&rpc.input())?;
    let inst = rpc.context().instance();
    let rc = if msg.grp_id == inst.primary_group().id() {
        error!("refusing to destroy the primary group {}", msg.grp_id);
        Error::Inval.code()
    } else if inst.groups().remove(&msg.grp_id).is_some() {
        debug!("destroyed group {}", msg.grp_id);
        0
    } else {
        error!("group {} not known", msg.grp_id);
        Error::Inval.code()
    };
    let out = GrpDestroyOut {
        failed_ranks: RankList::default(),
        rank: inst.self_rank(),
        rc,
    };
    {
        let mut buf = rpc.output();
        out.encode(buf.as_mut_slice())?;
    }
    rpc.reply_send()
}

pub(crate) fn uri_lookup_handler(rpc: &RpcHandle) -> Result<()> {
    let msg = UriLookupIn::decode(&rpc.input())?;
    let inst = rpc.context().instance();
    let (uri, rc) = match inst.groups().lookup(&msg.grp_id) {
        Some(grp) => match grp.uri(msg.rank) {
            Some(uri) => (uri, 0),
            None => (String::new(), Error::Inval.code()),
        },
        None => (String::new(), Error::Inval.code()),
    };
    let out = UriLookupOut { uri, rc };
    {
        let mut buf = rpc.output();
        out.encode(buf.as_mut_slice())?;
    }
    rpc.reply_send()
}
