use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::dtype::Element;
use crate::error::{Error, Result};

// Storage: the flat buffer every view points into
//
// A Storage owns one contiguous run of elements. Views (Tensor) share it
// through an Arc and describe which slots they reach with a Layout.
//
// MUTATION:
//
//   Elements sit in UnsafeCells so that two views of one buffer (e.g. `a`
//   and `a.transpose(0, 1)`) can be read and written in the same traversal.
//   Access goes through raw pointers handed out by the apply engine, which
//   takes the storage's traversal lock for writing first. Readers outside
//   the engine (`to_vec`) take the same lock for reading.
//
// VERSION COUNTER:
//
//   Every in-place write bumps a counter shared by all views of the buffer.
//   Autograd snapshots it when saving a tensor for backward and refuses to
//   use the tensor if the counter moved.

/// Where a storage's data nominally lives.
///
/// Data is always host resident in this crate; the tag lets backend
/// selection route work to an external accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

struct StorageInner<E> {
    data: Box<[UnsafeCell<E>]>,
    version: AtomicU64,
    device: Device,
    lock: RwLock<()>,
}

// SAFETY: element access goes through raw pointers obtained while holding
// `lock` (write for the apply engine, read for plain readers), so no two
// threads touch a cell concurrently except the disjoint partitions of the
// parallel apply path.
unsafe impl<E: Send> Send for StorageInner<E> {}
unsafe impl<E: Send + Sync> Sync for StorageInner<E> {}

/// Shared, reference-counted element buffer with a version counter.
pub struct Storage<E> {
    inner: Arc<StorageInner<E>>,
}

impl<E> Clone for Storage<E> {
    fn clone(&self) -> Self {
        Storage {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Element> fmt::Debug for Storage<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Storage(len={}, dtype={}, device={}, version={})",
            self.len(),
            E::DTYPE,
            self.device(),
            self.version()
        )
    }
}

impl<E: Element> Storage<E> {
    /// Allocate `len` elements set to `fill`, reporting allocation failure
    /// instead of aborting.
    pub fn try_alloc(len: usize, fill: E, device: Device) -> Result<Self> {
        let mut cells: Vec<UnsafeCell<E>> = Vec::new();
        cells
            .try_reserve_exact(len)
            .map_err(|_| Error::AllocationFailed {
                bytes: len.saturating_mul(E::DTYPE.size_in_bytes()),
            })?;
        cells.resize_with(len, || UnsafeCell::new(fill));
        Ok(Self::from_cells(cells.into_boxed_slice(), device))
    }

    /// Take ownership of an existing vector.
    pub fn from_vec(data: Vec<E>, device: Device) -> Self {
        let cells: Box<[UnsafeCell<E>]> = data.into_iter().map(UnsafeCell::new).collect();
        Self::from_cells(cells, device)
    }

    fn from_cells(data: Box<[UnsafeCell<E>]>, device: Device) -> Self {
        Storage {
            inner: Arc::new(StorageInner {
                data,
                version: AtomicU64::new(0),
                device,
                lock: RwLock::new(()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    pub fn device(&self) -> Device {
        self.inner.device
    }

    /// Current value of the shared version counter.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Record an in-place modification.
    pub fn bump_version(&self) -> u64 {
        self.inner.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether two handles refer to the same buffer.
    pub fn same_storage(&self, other: &Storage<E>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Address used to order lock acquisition across storages.
    pub(crate) fn lock_key(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn traversal_lock(&self) -> &RwLock<()> {
        &self.inner.lock
    }

    /// Base pointer of the buffer. Dereferencing it requires holding the
    /// traversal lock.
    pub(crate) fn base_ptr(&self) -> *mut E {
        // UnsafeCell<E> has the same layout as E.
        UnsafeCell::raw_get(self.inner.data.as_ptr())
    }

    pub(crate) fn read_guard(&self) -> Result<Held<RwLockReadGuard<'_, ()>>> {
        let mut held = Held::claim(&[self.lock_key()])?;
        held.guards.push(
            self.inner
                .lock
                .read()
                .map_err(|_| Error::msg("storage lock poisoned"))?,
        );
        Ok(held)
    }

    /// Read one slot. Caller holds the traversal lock.
    pub(crate) fn read_at(&self, index: usize) -> E {
        // SAFETY: the caller holds the lock, and `index` is bounds checked
        // by the slice access.
        unsafe { *self.inner.data[index].get() }
    }
}

/// A vector of `len` copies of `fill`, or `AllocationFailed` when the
/// allocator refuses the request.
pub fn try_vec<T: Clone>(len: usize, fill: T) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| Error::AllocationFailed {
            bytes: len.saturating_mul(std::mem::size_of::<T>()),
        })?;
    v.resize(len, fill);
    Ok(v)
}

thread_local! {
    // Lock keys of the storages this thread is traversing or reading.
    static HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Lock guards registered as held by the current thread. Dropping it
/// unregisters the keys and releases the locks.
pub(crate) struct Held<G> {
    keys: Vec<usize>,
    guards: Vec<G>,
}

impl<G> Held<G> {
    /// Register `keys`, failing if this thread already holds any of them.
    /// Blocking on such a lock would never return.
    fn claim(keys: &[usize]) -> Result<Self> {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if keys.iter().any(|k| held.contains(k)) {
                return Err(Error::StorageReentered);
            }
            held.extend_from_slice(keys);
            Ok(())
        })?;
        Ok(Held {
            keys: keys.to_vec(),
            guards: Vec::with_capacity(keys.len()),
        })
    }

    pub(crate) fn keys(&self) -> &[usize] {
        &self.keys
    }
}

impl Held<()> {
    /// Mark `keys` as held on a worker thread running a segment for a
    /// traversal whose locks another thread owns.
    pub(crate) fn on_worker(keys: &[usize]) -> Self {
        HELD.with(|held| held.borrow_mut().extend_from_slice(keys));
        Held {
            keys: keys.to_vec(),
            guards: Vec::new(),
        }
    }
}

impl<G> Drop for Held<G> {
    fn drop(&mut self) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            for key in &self.keys {
                if let Some(i) = held.iter().rposition(|k| k == key) {
                    held.swap_remove(i);
                }
            }
        });
    }
}

/// Acquire the write lock of every distinct storage in `stores`, ordered by
/// address so that concurrent traversals over overlapping sets cannot
/// deadlock. Fails with `StorageReentered` if the calling thread already
/// holds one of them.
pub(crate) fn lock_all<'a>(
    stores: &mut [(usize, &'a RwLock<()>)],
) -> Result<Held<RwLockWriteGuard<'a, ()>>> {
    stores.sort_by_key(|&(key, _)| key);
    let mut keys: Vec<usize> = stores.iter().map(|&(key, _)| key).collect();
    keys.dedup();
    let mut held = Held::claim(&keys)?;
    let mut last = None;
    for &(key, lock) in stores.iter() {
        if last == Some(key) {
            continue;
        }
        last = Some(key);
        held.guards.push(
            lock.write()
                .map_err(|_| Error::msg("storage lock poisoned"))?,
        );
    }
    Ok(held)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_version() {
        let s = Storage::try_alloc(4, 1.5f32, Device::Cpu).unwrap();
        assert_eq!(s.len(), 4);
        assert_eq!(s.version(), 0);
        let view = s.clone();
        assert_eq!(view.bump_version(), 1);
        assert_eq!(s.version(), 1);
        assert!(s.same_storage(&view));
    }

    #[test]
    fn test_huge_alloc_fails_cleanly() {
        let err = Storage::try_alloc(usize::MAX / 2, 0f64, Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed { .. }));
    }

    #[test]
    fn test_try_vec() {
        assert_eq!(try_vec(3, 7u8).unwrap(), vec![7, 7, 7]);
        assert!(matches!(
            try_vec(usize::MAX / 4, 0f32),
            Err(Error::AllocationFailed { .. })
        ));
    }

    #[test]
    fn test_lock_all_dedups() {
        let a = Storage::from_vec(vec![1i64, 2], Device::Cpu);
        let b = a.clone();
        let c = Storage::from_vec(vec![3i64], Device::Cpu);
        let mut stores = vec![
            (c.lock_key(), c.traversal_lock()),
            (a.lock_key(), a.traversal_lock()),
            (b.lock_key(), b.traversal_lock()),
        ];
        let guards = lock_all(&mut stores).unwrap();
        assert_eq!(guards.guards.len(), 2);
    }

    #[test]
    fn test_relock_on_same_thread_fails() {
        let a = Storage::from_vec(vec![1.0f32, 2.0], Device::Cpu);
        let b = a.clone();
        let mut outer = vec![(a.lock_key(), a.traversal_lock())];
        let guards = lock_all(&mut outer).unwrap();
        assert!(matches!(b.read_guard(), Err(Error::StorageReentered)));
        let mut inner = vec![(b.lock_key(), b.traversal_lock())];
        assert!(matches!(lock_all(&mut inner), Err(Error::StorageReentered)));
        drop(guards);
        assert!(b.read_guard().is_ok());
        assert!(lock_all(&mut inner).is_ok());
    }

    #[test]
    fn test_device_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
    }
}
