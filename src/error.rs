//! Errors reported by the fallible job creation api.

use crate::job::JobHandle;

/// Why a job could not be created.
///
/// The sentinel-returning functions ([`JobSystem::create_job`] and friends)
/// collapse all of these into [`JobHandle::INVALID`].
///
/// [`JobSystem::create_job`]: crate::JobSystem::create_job
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// Every slot in the job pool is occupied.
    #[error("job pool exhausted ({capacity} slots in use)")]
    PoolExhausted {
        /// The size of the pool.
        capacity: usize,
    },
    /// The parent handle does not refer to a live job in this system.
    #[error("parent {0} is out of range or has been recycled")]
    InvalidParent(JobHandle),
    /// The parent job has already finished and cannot take new children.
    #[error("parent {0} has already completed")]
    ParentComplete(JobHandle),
}
