//! ULT creation on pooled stacks. The host runtime is abstracted behind
//! [`UltSpawner`]; the adapter acquires a stack, binds it through the
//! spawner's attributes, and wraps the user function so the stack goes
//! back to the pool exactly once when the ULT is done, however it ends.

use crate::{
    error::Result,
    stack_pool::{StackDesc, StackPool, DEFAULT_STACK_SIZE},
};
use std::ptr::NonNull;

pub type XstreamId = u32;

/// Creation attributes, mirroring the host runtime's thread attributes.
/// A caller-supplied `stack` means the caller manages stack memory and
/// the pool stays out of the way entirely.
#[derive(Clone, Debug, Default)]
pub struct UltAttr {
    pub stack: Option<(NonNull<u8>, usize)>,
    pub stack_size: Option<usize>,
}

/// The host runtime's ULT creation surface.
///
/// `entry` is consumed either way: a spawner that fails must drop it
/// unrun, which is what releases any pooled stack bound to it.
pub trait UltSpawner {
    fn spawn(&self, attr: &UltAttr, entry: Box<dyn FnOnce() + Send + 'static>) -> Result<()>;

    fn spawn_on(
        &self,
        xstream: XstreamId,
        attr: &UltAttr,
        entry: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<()>;
}

/// Returns the held stack to the pool on drop. Dropping happens when the
/// entry closure finishes, unwinds, or is thrown away by a failed spawn,
/// which is exactly the set of ways a ULT's life can end.
struct StackGuard {
    pool: &'static StackPool,
    desc: Option<Box<StackDesc>>,
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        if let Some(desc) = self.desc.take() {
            self.pool.release(desc);
        }
    }
}

enum Target {
    Anywhere,
    Xstream(XstreamId),
}

fn create<S, F>(
    spawner: &S,
    target: Target,
    pool: &'static StackPool,
    func: F,
    attr: Option<&UltAttr>,
) -> Result<()>
where
    S: UltSpawner + ?Sized,
    F: FnOnce() + Send + 'static,
{
    if let Some(attr) = attr {
        if attr.stack.is_some() {
            // another stack allocation method is in use, nothing to do
            return match target {
                Target::Anywhere => spawner.spawn(attr, Box::new(func)),
                Target::Xstream(x) => spawner.spawn_on(x, attr, Box::new(func)),
            };
        }
    }

    let mut stack_size = DEFAULT_STACK_SIZE;
    if let Some(requested) = attr.and_then(|a| a.stack_size) {
        if requested > stack_size {
            stack_size = requested;
        }
    }
    let desc = pool.acquire(stack_size)?;

    // the attribute built here is ours to drop, never the caller's
    let mut local_attr = attr.cloned().unwrap_or_default();
    local_attr.stack = Some((desc.base(), desc.size()));

    let guard = StackGuard {
        pool,
        desc: Some(desc),
    };
    let entry = Box::new(move || {
        let _stack = guard;
        func();
    });
    match target {
        Target::Anywhere => spawner.spawn(&local_attr, entry),
        Target::Xstream(x) => spawner.spawn_on(x, &local_attr, entry),
    }
}

/// Create a ULT running `func` on a stack from `pool` (or on the stack
/// the caller put into `attr`, bypassing the pool).
pub fn ult_create<S, F>(
    spawner: &S,
    pool: &'static StackPool,
    func: F,
    attr: Option<&UltAttr>,
) -> Result<()>
where
    S: UltSpawner + ?Sized,
    F: FnOnce() + Send + 'static,
{
    create(spawner, Target::Anywhere, pool, func, attr)
}

/// Same as [`ult_create`], pinned to a specific execution stream.
pub fn ult_create_on_xstream<S, F>(
    spawner: &S,
    xstream: XstreamId,
    pool: &'static StackPool,
    func: F,
    attr: Option<&UltAttr>,
) -> Result<()>
where
    S: UltSpawner + ?Sized,
    F: FnOnce() + Send + 'static,
{
    create(spawner, Target::Xstream(xstream), pool, func, attr)
}
