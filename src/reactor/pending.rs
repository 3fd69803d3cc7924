use std::io;
use std::task::Waker;

use slab::Slab;

use crate::reactor::errors::ReactorError;

/// Raw outcome of one completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqeResult {
    pub result: i32,
    pub flags: u32,
}

impl CqeResult {
    /// Maps the kernel result convention (negative errno) onto `io::Result`.
    pub fn ok(self) -> io::Result<i32> {
        if self.result >= 0 {
            Ok(self.result)
        } else {
            Err(io::Error::from_raw_os_error(-self.result))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpState {
    /// Submitted, completion not yet seen.
    Pending,
    /// Completion arrived, outcome not yet consumed.
    Ready(CqeResult),
    /// The owning future was dropped mid-flight. The record is kept until
    /// the kernel posts the completion, then silently freed.
    Orphaned,
}

/// Bookkeeping for one submitted operation, addressed by its slab key.
#[derive(Debug)]
pub(crate) struct InflightOp {
    waker: Option<Waker>,
    state: OpState,
}

impl InflightOp {
    pub(crate) fn new(waker: Waker) -> Self {
        Self {
            waker: Some(waker),
            state: OpState::Pending,
        }
    }

    fn set_waker(&mut self, waker: &Waker) {
        if let Some(existing) = &self.waker
            && existing.will_wake(waker)
        {
            return;
        }
        self.waker = Some(waker.clone());
    }
}

/// What happened when a completion was applied to its record.
pub(crate) enum CompletionOutcome {
    /// The record advanced to ready. The waker, if any, must be invoked by
    /// the caller once it no longer holds reactor borrows.
    Advanced(Option<Waker>),
    /// The record was orphaned and has been freed. The outcome is returned
    /// so kernel-owned resources it references can be reclaimed.
    Discarded(CqeResult),
}

/// Arena of in-flight operations. Slab keys double as `user_data` on
/// submission entries, so no pointers cross the kernel boundary.
pub(crate) struct PendingOps {
    slab: Slab<InflightOp>,
    capacity: usize,
}

/// A slot claimed in the arena but not yet holding a record. Lets callers
/// learn the key, stamp it on a submission entry, and only then commit.
pub(crate) struct ReservedOp<'a> {
    entry: slab::VacantEntry<'a, InflightOp>,
}

impl ReservedOp<'_> {
    pub(crate) fn key(&self) -> usize {
        self.entry.key()
    }

    pub(crate) fn commit(self, op: InflightOp) {
        self.entry.insert(op);
    }
}

impl PendingOps {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn reserve(&mut self) -> Result<ReservedOp<'_>, ReactorError> {
        if self.slab.len() == self.capacity {
            return Err(ReactorError::ArenaFull);
        }
        Ok(ReservedOp {
            entry: self.slab.vacant_entry(),
        })
    }

    /// Applies one reaped completion to its record.
    pub(crate) fn complete(
        &mut self,
        key: usize,
        result: i32,
        flags: u32,
    ) -> Result<CompletionOutcome, ReactorError> {
        let op = self.slab.get_mut(key).ok_or(ReactorError::UnknownKey(key))?;
        let outcome = CqeResult { result, flags };
        match op.state {
            OpState::Pending => {
                op.state = OpState::Ready(outcome);
                Ok(CompletionOutcome::Advanced(op.waker.take()))
            }
            OpState::Orphaned => {
                self.slab.remove(key);
                Ok(CompletionOutcome::Discarded(outcome))
            }
            OpState::Ready(_) => {
                debug_assert!(false, "duplicate completion for key {key}");
                Ok(CompletionOutcome::Advanced(None))
            }
        }
    }

    /// Consumes the record at `key` if its completion has arrived, otherwise
    /// re-arms the waker and leaves the record in place.
    pub(crate) fn poll_ready(
        &mut self,
        key: usize,
        waker: &Waker,
    ) -> Result<Option<CqeResult>, ReactorError> {
        let op = self.slab.get_mut(key).ok_or(ReactorError::UnknownKey(key))?;
        match op.state {
            OpState::Ready(outcome) => {
                self.slab.remove(key);
                Ok(Some(outcome))
            }
            OpState::Pending => {
                op.set_waker(waker);
                Ok(None)
            }
            OpState::Orphaned => {
                debug_assert!(false, "polled an orphaned record at key {key}");
                Ok(None)
            }
        }
    }

    /// Detaches the record at `key` from its dropped owner.
    ///
    /// Pending records are kept as orphans so the eventual completion can be
    /// matched and freed. Ready records are removed now, returning the
    /// unconsumed outcome.
    pub(crate) fn discard(&mut self, key: usize) -> Option<CqeResult> {
        let Some(op) = self.slab.get_mut(key) else {
            debug_assert!(false, "discarded an unknown key {key}");
            return None;
        };
        match op.state {
            OpState::Pending => {
                op.waker = None;
                op.state = OpState::Orphaned;
                None
            }
            OpState::Ready(outcome) => {
                self.slab.remove(key);
                Some(outcome)
            }
            OpState::Orphaned => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock_waker;

    fn insert(ops: &mut PendingOps, waker: Waker) -> usize {
        let reserved = ops.reserve().unwrap();
        let key = reserved.key();
        reserved.commit(InflightOp::new(waker));
        key
    }

    #[test]
    fn test_complete_then_poll_consumes_record() {
        let mut ops = PendingOps::new(4);
        let (waker, count) = mock_waker();
        let key = insert(&mut ops, waker.clone());

        match ops.complete(key, 11, 0).unwrap() {
            CompletionOutcome::Advanced(Some(w)) => w.wake(),
            _ => panic!("expected an advanced record with a waker"),
        }
        assert_eq!(count.get(), 1);

        let outcome = ops.poll_ready(key, &waker).unwrap().unwrap();
        assert_eq!(outcome.result, 11);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_poll_before_completion_re_arms_waker() {
        let mut ops = PendingOps::new(4);
        let (first, first_count) = mock_waker();
        let (second, second_count) = mock_waker();
        let key = insert(&mut ops, first);

        assert!(ops.poll_ready(key, &second).unwrap().is_none());
        match ops.complete(key, 0, 0).unwrap() {
            CompletionOutcome::Advanced(Some(w)) => w.wake(),
            _ => panic!("expected an advanced record with a waker"),
        }

        assert_eq!(first_count.get(), 0);
        assert_eq!(second_count.get(), 1);
    }

    #[test]
    fn test_reserve_fails_at_capacity() {
        let mut ops = PendingOps::new(2);
        let (waker, _) = mock_waker();
        insert(&mut ops, waker.clone());
        insert(&mut ops, waker);

        assert!(matches!(ops.reserve(), Err(ReactorError::ArenaFull)));
    }

    #[test]
    fn test_orphaned_record_is_freed_without_waking() {
        let mut ops = PendingOps::new(4);
        let (waker, count) = mock_waker();
        let key = insert(&mut ops, waker);

        assert!(ops.discard(key).is_none());
        assert_eq!(ops.len(), 1);

        match ops.complete(key, -libc::ECANCELED, 0).unwrap() {
            CompletionOutcome::Discarded(outcome) => {
                assert_eq!(outcome.result, -libc::ECANCELED);
            }
            _ => panic!("expected the orphan to be discarded"),
        }
        assert!(ops.is_empty());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_discard_after_completion_returns_outcome() {
        let mut ops = PendingOps::new(4);
        let (waker, _) = mock_waker();
        let key = insert(&mut ops, waker);

        ops.complete(key, 3, 0).unwrap();
        let outcome = ops.discard(key).unwrap();
        assert_eq!(outcome.result, 3);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_unknown_key_is_reported() {
        let mut ops = PendingOps::new(4);
        assert!(matches!(
            ops.complete(9, 0, 0),
            Err(ReactorError::UnknownKey(9))
        ));
    }
}
