//! Pool of mmap()'ed ULT stacks, based on MAP_STACK|MAP_GROWSDOWN
//! regions so the kernel's stack guard gap catches overruns and grows the
//! mapping downward on demand. Freed stacks are cached on a free list,
//! capped both in absolute number and as a percentage of live stacks.

use crate::error::{Error, Result};
use lazy_static::lazy_static;
use log::{debug, error};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::{
    collections::VecDeque,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

/// Stacks are mapped at least this large, whatever the request.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

pub const MAX_PERCENT_FREE_STACKS: u64 = 20;
pub const MAX_NUMBER_FREE_STACKS: u64 = 2000;

lazy_static! {
    /// Process-wide pool used by the ULT creation adapter.
    pub static ref STACK_POOL: StackPool = StackPool::new();
}

/// One mapped stack region. Descriptors live in their own allocations,
/// keyed to the owning ULT through the entry-adapter guard, so the whole
/// mapping is usable stack.
pub struct StackDesc {
    base: NonNull<u8>,
    size: usize,
}

// The descriptor owns its mapping outright; handing it to another thread
// hands the region over with it.
unsafe impl Send for StackDesc {}

impl StackDesc {
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

struct PoolInner {
    /// Recycled stacks, most recently released first.
    free: VecDeque<Box<StackDesc>>,
    free_stacks: u64,
    alloced_stacks: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub alloced_stacks: u64,
    pub free_stacks: u64,
    pub maps: u64,
    pub unmaps: u64,
}

/// The stack pool proper. The mutex covers the free list and counters
/// only; mmap and munmap run outside it.
pub struct StackPool {
    inner: Mutex<PoolInner>,
    max_number_free: u64,
    max_percent_free: u64,
    maps: AtomicU64,
    unmaps: AtomicU64,
}

impl StackPool {
    pub fn new() -> StackPool {
        StackPool::with_limits(MAX_NUMBER_FREE_STACKS, MAX_PERCENT_FREE_STACKS)
    }

    /// A pool with custom recycling caps: at most `max_number_free`
    /// cached stacks once the cache also exceeds `max_percent_free`
    /// percent of all live stacks.
    pub fn with_limits(max_number_free: u64, max_percent_free: u64) -> StackPool {
        StackPool {
            inner: Mutex::new(PoolInner {
                free: VecDeque::new(),
                free_stacks: 0,
                alloced_stacks: 0,
            }),
            max_number_free,
            max_percent_free,
            maps: AtomicU64::new(0),
            unmaps: AtomicU64::new(0),
        }
    }

    /// Take a stack of at least `min_size` bytes: the first free one that
    /// fits, or a fresh mapping of `max(min_size, DEFAULT_STACK_SIZE)`.
    /// A request larger than every cached stack never gets a smaller one.
    pub fn acquire(&self, min_size: usize) -> Result<Box<StackDesc>> {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(pos) = inner.free.iter().position(|d| d.size >= min_size) {
                let desc = inner.free.remove(pos).unwrap();
                debug_assert!(inner.free_stacks > 0);
                inner.free_stacks -= 1;
                debug!(
                    "{:p} stack of size {} taken from free list, alloced_stacks={} free_stacks={}",
                    desc.base.as_ptr(),
                    desc.size,
                    inner.alloced_stacks,
                    inner.free_stacks
                );
                return Ok(desc);
            }
            inner.alloced_stacks += 1;
        }

        let size = min_size.max(DEFAULT_STACK_SIZE);
        let base = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE
                    | MapFlags::MAP_ANONYMOUS
                    | MapFlags::MAP_STACK
                    | MapFlags::MAP_GROWSDOWN,
                -1,
                0,
            )
        };
        match base {
            Ok(base) => {
                self.maps.fetch_add(1, Ordering::Relaxed);
                debug!("{:p} stack of size {} mapped", base, size);
                Ok(Box::new(StackDesc {
                    base: NonNull::new(base as *mut u8).unwrap(),
                    size,
                }))
            }
            Err(e) => {
                error!("failed to mmap ULT stack of size {}: {}", size, e);
                self.inner.lock().unwrap().alloced_stacks -= 1;
                Err(Error::NoMem)
            }
        }
    }

    /// Return a stack. It is cached unless the free list is over both
    /// caps, in which case the mapping is unmapped (outside the lock); an
    /// unmap failure leaks the region with an error log.
    pub fn release(&self, desc: Box<StackDesc>) {
        let to_unmap = {
            let mut inner = self.inner.lock().unwrap();
            if inner.free_stacks > self.max_number_free
                && inner.alloced_stacks > 0
                && inner.free_stacks * 100 / inner.alloced_stacks > self.max_percent_free
            {
                inner.alloced_stacks -= 1;
                Some(desc)
            } else {
                inner.free_stacks += 1;
                debug!(
                    "{:p} stack of size {} put on free list, alloced_stacks={} free_stacks={}",
                    desc.base.as_ptr(),
                    desc.size,
                    inner.alloced_stacks,
                    inner.free_stacks
                );
                inner.free.push_front(desc);
                None
            }
        };
        if let Some(desc) = to_unmap {
            self.unmap(&desc);
        }
    }

    fn unmap(&self, desc: &StackDesc) {
        let rc = unsafe { munmap(desc.base.as_ptr() as *mut libc::c_void, desc.size) };
        match rc {
            Ok(()) => {
                self.unmaps.fetch_add(1, Ordering::Relaxed);
                debug!("{:p} stack of size {} unmapped", desc.base.as_ptr(), desc.size);
            }
            Err(e) => {
                // nothing sane to do with the region; leak it
                error!(
                    "failed to munmap {:p} stack of size {}: {}",
                    desc.base.as_ptr(),
                    desc.size,
                    e
                );
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        PoolStats {
            alloced_stacks: inner.alloced_stacks,
            free_stacks: inner.free_stacks,
            maps: self.maps.load(Ordering::Relaxed),
            unmaps: self.unmaps.load(Ordering::Relaxed),
        }
    }
}

impl Default for StackPool {
    fn default() -> StackPool {
        StackPool::new()
    }
}

impl Drop for StackPool {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        let free: Vec<_> = inner.free.drain(..).collect();
        inner.free_stacks = 0;
        drop(inner);
        for desc in &free {
            self.unmap(desc);
        }
    }
}
