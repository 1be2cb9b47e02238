//! Per-component object recycling pool.
//!
//! Event envelopes and device snapshots are allocated on the hot path; the
//! pool caps steady-state allocation churn. Pools are per-component and not
//! shared across threads in the pipeline, but the guard type is `Send` so a
//! pooled object can travel with its batch.

use std::sync::Arc;

use parking_lot::Mutex;

/// Objects returned to a pool are reset before reuse.
pub trait Reset {
    fn reset(&mut self);
}

#[derive(Debug)]
struct PoolInner<T> {
    free: Mutex<Vec<T>>,
    max_idle: usize,
}

/// Fixed-idle-size recycling pool. `acquire` hands out a recycled object or
/// a fresh default; dropping the guard returns it.
#[derive(Debug)]
pub struct ObjectPool<T: Default + Reset> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Default + Reset> ObjectPool<T> {
    pub fn new(max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(max_idle)),
                max_idle,
            }),
        }
    }

    pub fn acquire(&self) -> Pooled<T> {
        let object = self.inner.free.lock().pop().unwrap_or_default();
        Pooled {
            object: Some(object),
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl<T: Default + Reset> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Guard over a pooled object; returns it to the pool on drop.
#[derive(Debug)]
pub struct Pooled<T: Default + Reset> {
    object: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T: Default + Reset> Pooled<T> {
    /// Detaches the object from the pool permanently.
    pub fn into_inner(mut self) -> T {
        self.object.take().expect("object already taken")
    }
}

impl<T: Default + Reset> std::ops::Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.object.as_ref().expect("object already taken")
    }
}

impl<T: Default + Reset> std::ops::DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("object already taken")
    }
}

impl<T: Default + Reset> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(mut object) = self.object.take() {
            let mut free = self.pool.free.lock();
            if free.len() < self.pool.max_idle {
                object.reset();
                free.push(object);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Envelope {
        payload: Vec<u8>,
    }

    impl Reset for Envelope {
        fn reset(&mut self) {
            self.payload.clear();
        }
    }

    #[test]
    fn recycles_returned_objects() {
        let pool: ObjectPool<Envelope> = ObjectPool::new(4);
        {
            let mut envelope = pool.acquire();
            envelope.payload.extend_from_slice(b"data");
        }
        assert_eq!(pool.idle(), 1);
        let envelope = pool.acquire();
        assert!(envelope.payload.is_empty(), "reused object must be reset");
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn idle_cap_bounds_retention() {
        let pool: ObjectPool<Envelope> = ObjectPool::new(1);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn into_inner_detaches() {
        let pool: ObjectPool<Envelope> = ObjectPool::new(4);
        let envelope = pool.acquire().into_inner();
        drop(envelope);
        assert_eq!(pool.idle(), 0);
    }
}
