//! Configuration for a [`JobSystem`](crate::JobSystem).

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;
use core::fmt;
use core::num::NonZero;

use crate::platform::available_parallelism;

/// Called with the payload of a panic that escaped a job body.
pub type PanicHandler = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

/// Settings fixed for the lifetime of one [`JobSystem`](crate::JobSystem).
#[derive(Clone)]
pub struct JobSystemConfig {
    /// Number of worker threads. Zero selects one less than the available
    /// parallelism, with a minimum of one.
    pub num_workers: u32,
    /// Number of slots in the job pool. The pool never grows.
    pub max_jobs: usize,
    /// Receives panics raised by job bodies. When unset, panics are logged.
    pub panic_handler: Option<PanicHandler>,
}

impl JobSystemConfig {
    /// The pool size used by [`JobSystemConfig::default`].
    pub const DEFAULT_MAX_JOBS: usize = 4096;

    /// Sets the number of worker threads (zero means "auto").
    pub fn with_workers(mut self, num_workers: u32) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Sets the size of the job pool.
    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    /// Installs a handler for panics raised by job bodies.
    pub fn with_panic_handler<H>(mut self, handler: H) -> Self
    where
        H: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        self.panic_handler = Some(Arc::new(handler));
        self
    }

    /// The number of workers that will actually be spawned.
    pub fn resolved_workers(&self) -> u32 {
        if self.num_workers != 0 {
            return self.num_workers;
        }
        let available = available_parallelism().map(NonZero::get).unwrap_or(1);
        let available = u32::try_from(available).unwrap_or(u32::MAX);
        available.saturating_sub(1).max(1)
    }

    /// The pool size that will actually be allocated. Slot ids are 32-bit and
    /// 1-based, and the pool always has at least one slot.
    pub fn resolved_max_jobs(&self) -> usize {
        self.max_jobs.clamp(1, (u32::MAX - 1) as usize)
    }
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            max_jobs: Self::DEFAULT_MAX_JOBS,
            panic_handler: None,
        }
    }
}

impl fmt::Debug for JobSystemConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSystemConfig")
            .field("num_workers", &self.num_workers)
            .field("max_jobs", &self.max_jobs)
            .field("panic_handler", &self.panic_handler.is_some())
            .finish()
    }
}
