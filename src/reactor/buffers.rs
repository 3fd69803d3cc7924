use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, Ordering};

use io_uring::types;

use crate::reactor::errors::ReactorError;
use crate::reactor::ring::Reactor;
use crate::utils::sys::{CACHE_LINE_SIZE, get_page_size};

/// Group id under which the shared receive buffers are registered.
pub(crate) const BUFFER_GROUP: u16 = 0;

/// The control ring shared with the kernel for one buffer group.
///
/// Entries describe free buffers. The kernel consumes from the head as
/// receives land; we produce at the tail when buffers are registered or
/// handed back.
pub(crate) struct BufRingMem {
    ring: NonNull<types::BufRingEntry>,
    layout: Layout,
    tail: NonNull<u16>,
    entries: u16,
    mask: u16,
}

impl BufRingMem {
    fn alloc(entries: u16) -> Result<Self, ReactorError> {
        debug_assert!(entries.is_power_of_two());
        let size = usize::from(entries) * size_of::<types::BufRingEntry>();
        let layout = Layout::from_size_align(size, get_page_size())
            .map_err(|_| ReactorError::AllocFailed("buffer ring layout"))?;
        // SAFETY: layout has a nonzero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ring = NonNull::new(ptr.cast::<types::BufRingEntry>())
            .ok_or(ReactorError::AllocFailed("buffer ring"))?;
        // SAFETY: `ring` points at the first entry of a live allocation.
        let tail = unsafe { types::BufRingEntry::tail(ring.as_ptr()).cast_mut() };
        let tail = NonNull::new(tail).ok_or(ReactorError::AllocFailed("buffer ring tail"))?;
        Ok(Self {
            ring,
            layout,
            tail,
            entries,
            mask: entries - 1,
        })
    }

    pub(crate) fn as_addr(&self) -> u64 {
        self.ring.as_ptr() as u64
    }

    pub(crate) fn entries(&self) -> u16 {
        self.entries
    }

    /// Fills the slot addressed by `tail_offset` with one free buffer.
    /// Not visible to the kernel until a matching `advance`.
    pub(crate) fn write_entry(&mut self, tail_offset: u16, addr: u64, len: u32, bid: u16) {
        let idx = usize::from(tail_offset & self.mask);
        // SAFETY: idx is masked into the allocation.
        let entry = unsafe { &mut *self.ring.as_ptr().add(idx) };
        entry.set_addr(addr);
        entry.set_len(len);
        entry.set_bid(bid);
    }

    /// Publishes `count` filled slots to the kernel.
    pub(crate) fn advance(&self, count: u16) {
        self.tail_atomic().fetch_add(count, Ordering::Release);
    }

    pub(crate) fn tail_value(&self) -> u16 {
        self.tail_atomic().load(Ordering::Relaxed)
    }

    fn tail_atomic(&self) -> &AtomicU16 {
        // SAFETY: the tail word lives inside the ring allocation and is
        // shared with the kernel, which also accesses it atomically.
        unsafe { AtomicU16::from_ptr(self.tail.as_ptr()) }
    }
}

impl Drop for BufRingMem {
    fn drop(&mut self) {
        // SAFETY: allocated in `alloc` with the stored layout.
        unsafe { alloc::dealloc(self.ring.as_ptr().cast(), self.layout) };
    }
}

/// Contiguous backing storage for every buffer in the group.
struct PoolMem {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl PoolMem {
    fn alloc(count: usize, buf_size: usize) -> Result<Self, ReactorError> {
        let total = count
            .checked_mul(buf_size)
            .ok_or(ReactorError::AllocFailed("buffer storage size"))?;
        let layout = Layout::from_size_align(total, CACHE_LINE_SIZE)
            .map_err(|_| ReactorError::AllocFailed("buffer storage layout"))?;
        // SAFETY: layout has a nonzero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(ReactorError::AllocFailed("buffer storage"))?;
        Ok(Self { ptr, layout })
    }

    fn base_addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    fn buf_ptr(&self, id: usize, buf_size: usize) -> NonNull<u8> {
        // SAFETY: callers bound `id` by the registered count.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(id * buf_size)) }
    }
}

impl Drop for PoolMem {
    fn drop(&mut self) {
        // SAFETY: allocated in `alloc` with the stored layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A bounded window into one borrowed buffer.
///
/// The view stays valid until the buffer id is released back to the pool.
/// It is thread-local, like the pool it came from.
pub struct BufView {
    ptr: NonNull<u8>,
    len: usize,
    id: u16,
    _not_send: PhantomData<*const ()>,
}

impl BufView {
    fn new(ptr: NonNull<u8>, len: usize, id: u16) -> Self {
        Self {
            ptr,
            len,
            id,
            _not_send: PhantomData,
        }
    }

    /// The zero-length sentinel handed out when a borrow fails.
    pub fn empty() -> Self {
        Self::new(NonNull::dangling(), 0, 0)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for BufView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` covers `len` initialized bytes while the borrow is
        // outstanding.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for BufView {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: same as `deref`; the pool hands out at most one view per id.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for BufView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufView")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

/// Fixed set of receive buffers shared with the kernel, plus the borrow map
/// tracking which ids are currently lent out to callers.
///
/// Ids are `u16`, bounding the pool at 65536 slots.
pub struct BufferPool {
    storage: Option<PoolMem>,
    ring: Option<BufRingMem>,
    borrowed: Vec<u64>,
    count: u16,
    buf_size: usize,
    group: u16,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            storage: None,
            ring: None,
            borrowed: Vec::new(),
            count: 0,
            buf_size: 0,
            group: BUFFER_GROUP,
        }
    }

    /// Allocates `count` buffers of `size` bytes, registers them with the
    /// kernel under this pool's group id and publishes every slot at once.
    pub fn register(
        &mut self,
        reactor: &Reactor,
        count: u16,
        size: u32,
    ) -> Result<(), ReactorError> {
        if self.is_registered() {
            return Err(ReactorError::BuffersAlreadyRegistered);
        }
        if count == 0 || !count.is_power_of_two() {
            return Err(ReactorError::InvalidBufferCount(count));
        }
        assert!(size > 0, "buffer size must be nonzero");

        let storage = PoolMem::alloc(usize::from(count), size as usize)?;
        let mut ring = BufRingMem::alloc(count)?;
        reactor.register_shared_buffers(&mut ring, self.group, storage.base_addr(), size)?;

        self.borrowed = vec![0u64; usize::from(count).div_ceil(64)];
        self.storage = Some(storage);
        self.ring = Some(ring);
        self.count = count;
        self.buf_size = size as usize;
        Ok(())
    }

    /// Marks buffer `id` borrowed and returns a view of its first `size`
    /// bytes. A borrow that cannot be satisfied is logged and reported as
    /// the empty view.
    pub fn borrow(&mut self, id: u16, size: usize) -> BufView {
        let Some(storage) = &self.storage else {
            tracing::error!(id, "borrow before shared buffers were registered");
            return BufView::empty();
        };
        if id >= self.count {
            tracing::error!(id, count = self.count, "borrow of an id outside the pool");
            return BufView::empty();
        }
        if size == 0 || size > self.buf_size {
            // A zero-byte view would be indistinguishable from the failure
            // sentinel, so it must not mark the id borrowed.
            tracing::error!(id, size, buf_size = self.buf_size, "borrow size outside (0, buf_size]");
            return BufView::empty();
        }
        if self.test_bit(id) {
            tracing::error!(id, "buffer is already borrowed");
            return BufView::empty();
        }
        let ptr = storage.buf_ptr(usize::from(id), self.buf_size);
        self.set_bit(id);
        BufView::new(ptr, size, id)
    }

    /// Returns buffer `id` to the pool and republishes it to the kernel.
    pub fn release(&mut self, reactor: &Reactor, id: u16) {
        if self.storage.is_none() || id >= self.count {
            tracing::error!(id, "release of an id outside the pool");
            return;
        }
        if !self.test_bit(id) {
            tracing::warn!(id, "release of a buffer that is not borrowed");
            return;
        }
        self.clear_bit(id);
        self.requeue(reactor, id);
    }

    /// Hands buffer `id` back to the kernel without touching the borrow map.
    /// Used for completions whose owner vanished before borrowing.
    pub(crate) fn requeue(&mut self, reactor: &Reactor, id: u16) {
        let (Some(storage), Some(ring)) = (&self.storage, &mut self.ring) else {
            return;
        };
        if id >= self.count {
            return;
        }
        let addr = storage.base_addr() + u64::from(id) * self.buf_size as u64;
        reactor.republish(ring, addr, self.buf_size as u32, id);
    }

    /// Unregisters the group from the kernel and frees the backing memory.
    pub(crate) fn unregister(&mut self, reactor: &Reactor) {
        if self.ring.is_some() {
            if let Err(err) = reactor.unregister_shared_buffers(self.group) {
                tracing::warn!(error = %err, "failed to unregister shared buffers");
            }
        }
        self.ring = None;
        self.storage = None;
        self.borrowed.clear();
        self.count = 0;
        self.buf_size = 0;
    }

    pub fn is_registered(&self) -> bool {
        self.storage.is_some()
    }

    pub fn is_borrowed(&self, id: u16) -> bool {
        id < self.count && self.test_bit(id)
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    fn test_bit(&self, id: u16) -> bool {
        self.borrowed[usize::from(id) / 64] & (1u64 << (id % 64)) != 0
    }

    fn set_bit(&mut self, id: u16) {
        self.borrowed[usize::from(id) / 64] |= 1u64 << (id % 64);
    }

    fn clear_bit(&mut self, id: u16) {
        self.borrowed[usize::from(id) / 64] &= !(1u64 << (id % 64));
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
