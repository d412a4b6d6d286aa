use std::sync::atomic::{AtomicU64, Ordering};
use crate::channel::init::now_nanos;
use crate::core::error::{Error, Result};
use crate::core::types::{ObjectId, CONSTANT_ID_BASE, OBJECT_ID_BASE};

/// Hands out object ids above everything found in the storage
pub struct ObjectIdProvider {
    next: AtomicU64,
}

impl ObjectIdProvider {
    pub fn new(highest: Option<ObjectId>) -> Self {
        let next = highest.map(|oid| oid.0 + 1).unwrap_or(OBJECT_ID_BASE).max(OBJECT_ID_BASE);
        ObjectIdProvider { next: AtomicU64::new(next) }
    }

    pub fn next_object_id(&self) -> Result<ObjectId> {
        self.reserve(1)
    }

    /// Reserves `count` consecutive ids and returns the first.
    pub fn reserve(&self, count: u64) -> Result<ObjectId> {
        let first = self.next.fetch_add(count, Ordering::SeqCst);
        if first + count > CONSTANT_ID_BASE {
            return Err(Error::invalid_state("object id range exhausted"));
        }
        Ok(ObjectId(first))
    }

    /// Makes sure ids up to `object_id` are never handed out.
    pub fn observe(&self, object_id: ObjectId) {
        if object_id.is_object_range() {
            self.next.fetch_max(object_id.0 + 1, Ordering::SeqCst);
        }
    }

    pub fn peek(&self) -> ObjectId {
        ObjectId(self.next.load(Ordering::SeqCst))
    }
}

/// Strictly increasing nanosecond timestamps, never below the storage's latest
pub struct TimestampProvider {
    last: AtomicU64,
}

impl TimestampProvider {
    pub fn new(initial: u64) -> Self {
        TimestampProvider { last: AtomicU64::new(initial) }
    }

    pub fn advance_to(&self, timestamp: u64) {
        self.last.fetch_max(timestamp, Ordering::SeqCst);
    }

    pub fn next(&self) -> u64 {
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let next = now_nanos().max(last + 1);
            match self.last.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ids_continue_after_highest() {
        let provider = ObjectIdProvider::new(Some(ObjectId(OBJECT_ID_BASE + 41)));
        assert_eq!(provider.next_object_id().unwrap(), ObjectId(OBJECT_ID_BASE + 42));
        assert_eq!(provider.reserve(10).unwrap(), ObjectId(OBJECT_ID_BASE + 43));
        provider.observe(ObjectId(OBJECT_ID_BASE + 100));
        assert_eq!(provider.next_object_id().unwrap(), ObjectId(OBJECT_ID_BASE + 101));

        let fresh = ObjectIdProvider::new(None);
        assert_eq!(fresh.peek(), ObjectId(OBJECT_ID_BASE));
    }

    #[test]
    fn timestamps_increase_past_a_future_seed() {
        let far = now_nanos() + 1_000_000_000_000;
        let provider = TimestampProvider::new(far);
        let a = provider.next();
        let b = provider.next();
        assert_eq!(a, far + 1);
        assert_eq!(b, far + 2);
    }
}
