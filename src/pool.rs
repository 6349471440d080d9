//! Reuse pools for byte buffers and for single-call engine instances.
//!
//! Pooling never changes results. A `Buf` or `Pooled` that is dropped
//! without being explicitly released is still returned to its pool,
//! and one that is never returned only costs a future allocation.

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

const N_CLASSES: usize = 19;

/// Capacities of the buffers handed out by a `BufferPool`.
pub(crate) const SIZE_CLASSES: [usize; N_CLASSES] = [
    64,       // 0x40
    128,      // 0x80
    256,      // 0x100
    512,      // 0x200
    1024,     // 0x400
    2048,     // 0x800
    4096,     // 0x1000
    8192,     // 0x2000
    16384,    // 0x4000
    32768,    // 0x8000
    65536,    // 0x10000
    131072,   // 0x20000
    262144,   // 0x40000
    524288,   // 0x80000
    1048576,  // 0x100000
    2097152,  // 0x200000
    4194304,  // 0x400000
    8388608,  // 0x800000
    16777216, // 0x1000000
];

/// The smallest class that can hold `len` bytes.
fn class_for_len(len: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|sz| *sz >= len)
}

/// The largest class that a buffer of `capacity` can satisfy.
fn class_for_capacity(capacity: usize) -> Option<usize> {
    SIZE_CLASSES.iter().rposition(|sz| *sz <= capacity)
}

/// A byte buffer that is either owned outright or borrowed from a
/// `BufferPool`.
///
/// This is the release handle for every buffer produced by encoding,
/// by operators, and by the `Computer`. Calling `release` gives the
/// bytes up and returns pooled storage for reuse. Releasing more than
/// once is harmless, and dropping a `Buf` releases it.
pub struct Buf {
    data: Vec<u8>,
    home: Option<BufferPool>,
}

impl Buf {
    /// Wraps an owned allocation that needs no pool.
    pub const fn owned(data: Vec<u8>) -> Buf {
        Buf { data, home: None }
    }

    /// Copies `bytes` into a new owned allocation.
    pub fn copy_from(bytes: &[u8]) -> Buf {
        Buf::owned(bytes.to_vec())
    }

    /// Returns true if releasing this buffer will hand its storage
    /// back to a pool.
    pub const fn is_pooled(&self) -> bool {
        self.home.is_some()
    }

    /// Mutable access for building up the contents.
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Detaches the bytes from any pool.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.home = None;
        mem::take(&mut self.data)
    }

    /// Gives up the bytes, returning pooled storage to its pool.
    /// The buffer is empty afterwards. Idempotent.
    pub fn release(&mut self) {
        let data = mem::take(&mut self.data);
        if let Some(home) = self.home.take() {
            home.give_back(data);
        }
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        self.release()
    }
}

impl Deref for Buf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Buf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("data", &self.data)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

#[derive(Default, Debug)]
struct SizeClass {
    free: Mutex<Vec<Vec<u8>>>,
    /// Flat combining.
    ///
    /// Buffers released while `free` is contended wait here until the
    /// next holder of the lock absorbs them.
    overflow: SegQueue<Vec<u8>>,
}

#[derive(Debug)]
struct BufferPoolInner {
    classes: Vec<SizeClass>,
    max_per_class: usize,
    max_buffer_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// A size-classed free list of byte buffers, shared by cheap clones.
#[derive(Clone, Debug)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl Default for BufferPool {
    fn default() -> BufferPool {
        let config = crate::Config::default();
        BufferPool::new(
            config.max_buffers_per_class,
            config.max_pooled_buffer_size,
        )
    }
}

impl BufferPool {
    /// Creates a pool that retains at most `max_per_class` idle buffers
    /// in each size class and never retains a buffer whose capacity
    /// exceeds `max_buffer_size`.
    pub fn new(max_per_class: usize, max_buffer_size: usize) -> BufferPool {
        BufferPool {
            inner: Arc::new(BufferPoolInner {
                classes: (0..N_CLASSES).map(|_| SizeClass::default()).collect(),
                max_per_class,
                max_buffer_size,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Borrows an empty buffer with room for at least `len` bytes.
    /// Lengths beyond the largest size class get a plain allocation.
    pub fn borrow(&self, len: usize) -> Buf {
        let Some(class) = class_for_len(len) else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            return Buf::owned(Vec::with_capacity(len));
        };

        let reused = {
            let size_class = &self.inner.classes[class];
            let mut free = size_class.free.lock();
            absorb(&mut free, &size_class.overflow, self.inner.max_per_class);
            free.pop()
        };

        let data = if let Some(data) = reused {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            data
        } else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            log::trace!("buffer pool miss for class {}", SIZE_CLASSES[class]);
            Vec::with_capacity(SIZE_CLASSES[class])
        };

        Buf { data, home: Some(self.clone()) }
    }

    /// Borrows a buffer and fills it with a copy of `bytes`.
    pub fn copy_from(&self, bytes: &[u8]) -> Buf {
        let mut buf = self.borrow(bytes.len());
        buf.as_mut_vec().extend_from_slice(bytes);
        buf
    }

    fn give_back(&self, mut data: Vec<u8>) {
        if cfg!(feature = "disable-pooling") {
            return;
        }
        if data.capacity() > self.inner.max_buffer_size {
            return;
        }
        let Some(class) = class_for_capacity(data.capacity()) else {
            return;
        };

        data.clear();

        let size_class = &self.inner.classes[class];
        if let Some(mut free) = size_class.free.try_lock() {
            absorb(&mut free, &size_class.overflow, self.inner.max_per_class);
            if free.len() < self.inner.max_per_class {
                free.push(data);
            }
        } else {
            size_class.overflow.push(data);
        }
    }

    /// Returns the counters for (reused, freshly allocated) buffers.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.inner.hits.load(Ordering::Acquire),
            self.inner.misses.load(Ordering::Acquire),
        )
    }
}

fn absorb(
    free: &mut Vec<Vec<u8>>,
    overflow: &SegQueue<Vec<u8>>,
    max_per_class: usize,
) {
    while let Some(data) = overflow.pop() {
        if free.len() < max_per_class {
            free.push(data);
        }
    }
}

/// State that is cleared before an instance goes back to its pool.
pub trait Reset {
    /// Forgets everything from the previous call, keeping allocations
    /// that are worth reusing.
    fn reset(&mut self);
}

#[derive(Debug)]
struct PoolInner<T> {
    free: SegQueue<T>,
    max_idle: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// A free list of single-call instances such as `Computer`.
#[derive(Debug)]
pub(crate) struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Pool<T> {
        Pool { inner: self.inner.clone() }
    }
}

impl<T: Reset> Pool<T> {
    pub(crate) fn new(max_idle: usize) -> Pool<T> {
        Pool {
            inner: Arc::new(PoolInner {
                free: SegQueue::new(),
                max_idle,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Takes an idle instance, or builds one with `make` if none is idle.
    pub(crate) fn checkout<F>(&self, make: F) -> Pooled<T>
    where
        F: FnOnce() -> T,
    {
        let item = if let Some(item) = self.inner.free.pop() {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            item
        } else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            make()
        };

        Pooled { item: Some(item), home: self.clone() }
    }

    fn put(&self, mut item: T) {
        item.reset();
        if cfg!(not(feature = "disable-pooling"))
            && self.inner.free.len() < self.inner.max_idle
        {
            self.inner.free.push(item);
        }
    }

    /// Returns the counters for (reused, freshly built) instances.
    pub(crate) fn counters(&self) -> (u64, u64) {
        (
            self.inner.hits.load(Ordering::Acquire),
            self.inner.misses.load(Ordering::Acquire),
        )
    }
}

/// An instance checked out of a pool. It is reset and returned when
/// dropped, whether the call it served succeeded or not.
pub struct Pooled<T: Reset> {
    // only `None` while being dropped
    item: Option<T>,
    home: Pool<T>,
}

impl<T: Reset> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.home.put(item);
        }
    }
}

impl<T: Reset> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("Pooled item is only taken on drop")
    }
}

impl<T: Reset> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("Pooled item is only taken on drop")
    }
}

impl<T: Reset + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.item).finish()
    }
}
