//! Bounded recycling pool for short-lived control objects.
//!
//! Call/return churn creates and discards execution contexts and their
//! stacks at a high rate; the pool keeps a bounded free list of them so
//! the allocator is off the hot path. Releases beyond the bound destroy
//! the object instead of retaining it, which keeps bursty workloads from
//! growing the pool without limit.

use std::sync::Mutex;

/// A bounded free-list recycler.
///
/// Thread-safety: one mutex per pool instance. Contention is expected to
/// be low: pools are sized per allocation class and typically owned by a
/// single runtime.
pub struct Pool<T> {
    inner: Mutex<PoolInner<T>>,
    max_size: usize,
}

struct PoolInner<T> {
    head: Option<Box<PoolNode<T>>>,
    size: usize,
}

struct PoolNode<T> {
    value: T,
    next: Option<Box<PoolNode<T>>>,
}

impl<T> Drop for PoolInner<T> {
    fn drop(&mut self) {
        // Unlink iteratively; the default recursive drop would overflow
        // the native stack on a long free list.
        let mut head = self.head.take();
        while let Some(mut node) = head {
            head = node.next.take();
        }
    }
}

impl<T> Pool<T> {
    /// Create a pool retaining at most `max_size` released objects.
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                head: None,
                size: 0,
            }),
            max_size,
        }
    }

    /// Take a recycled object, if any.
    pub fn get(&self) -> Option<T> {
        let mut inner = self.lock();
        let node = inner.head.take()?;
        inner.head = node.next;
        inner.size -= 1;
        Some(node.value)
    }

    /// Return an object to the pool. Objects beyond the bound are
    /// destroyed immediately rather than retained.
    pub fn release(&self, value: T) {
        let mut inner = self.lock();
        if inner.size < self.max_size {
            let next = inner.head.take();
            inner.head = Some(Box::new(PoolNode { value, next }));
            inner.size += 1;
        }
        // else: drop on the way out of scope
    }

    /// Number of objects currently retained.
    pub fn size(&self) -> usize {
        self.lock().size
    }

    /// Destroy every retained object.
    pub fn clear(&self) {
        let mut inner = self.lock();
        // Unlink iteratively so a long free list cannot recurse on drop.
        let mut head = inner.head.take();
        inner.size = 0;
        drop(inner);
        while let Some(mut node) = head {
            head = node.next.take();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
