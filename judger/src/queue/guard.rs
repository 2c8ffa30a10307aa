use std::{sync::Arc, time::Instant};

use dashmap::{mapref::entry::Entry, DashMap};

use crate::model::SubmissionId;

/// The set of submissions this process is currently handling.
///
/// Every cycle that handles a submission holds a [`ClaimTicket`] for it; a
/// second cycle asking for the same id gets `None` until the ticket is gone.
#[derive(Debug, Clone, Default)]
pub struct ClaimGuard {
    in_flight: Arc<DashMap<SubmissionId, Instant>>,
}

impl ClaimGuard {
    pub fn new() -> ClaimGuard {
        Self::default()
    }

    pub fn try_acquire(&self, id: SubmissionId) -> Option<ClaimTicket> {
        match self.in_flight.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(v) => {
                v.insert(Instant::now());
                Some(ClaimTicket {
                    id,
                    in_flight: self.in_flight.clone(),
                })
            }
        }
    }

    pub fn contains(&self, id: SubmissionId) -> bool {
        self.in_flight.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

/// Proof that one cycle owns a submission id. Dropping it releases the id.
#[derive(Debug)]
pub struct ClaimTicket {
    id: SubmissionId,
    in_flight: Arc<DashMap<SubmissionId, Instant>>,
}

impl ClaimTicket {
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for ClaimTicket {
    fn drop(&mut self) {
        if let Some((_, since)) = self.in_flight.remove(&self.id) {
            tracing::trace!(
                submission_id = self.id,
                held_ms = since.elapsed().as_millis() as u64,
                "Released claim"
            );
        }
    }
}
