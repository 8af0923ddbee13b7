//! Contains a set of compile failure doctests.

// -----------------------------------------------------------------------------
// Ensures non-send data cannot be moved into a job.

/** ```compile_fail,E0277

use std::rc::Rc;
use jobsteal::{JobSystem, JobSystemConfig};

let jobs = JobSystem::new(JobSystemConfig::default().with_workers(1));

let r = Rc::new(22);
jobs.create_job(move |_| drop(r)); //~ ERROR

``` */
mod nonsend_job {}

/** ```compile_fail,E0277

use std::rc::Rc;
use jobsteal::{JobSystem, JobSystemConfig};

let jobs = JobSystem::new(JobSystemConfig::default().with_workers(1));

let parent = jobs.create_job(|_| ());
let r = Rc::new(22);
jobs.create_job_as_child(parent, move |_| drop(r)); //~ ERROR

``` */
mod nonsend_child {}

// -----------------------------------------------------------------------------
// Ensures jobs cannot borrow from the stack of the thread that created them.

/** ```compile_fail

use jobsteal::{JobSystem, JobSystemConfig};

let jobs = JobSystem::new(JobSystemConfig::default().with_workers(1));

let value = 7;
let job = jobs.create_job(|_| {
    let _ = value; //~ ERROR
});
jobs.run_and_wait(job);

``` */
mod borrowed_capture {}

// -----------------------------------------------------------------------------
// Ensures a job context cannot escape the job it was handed to.

/** ```compile_fail

use jobsteal::{JobContext, JobSystem, JobSystemConfig};

let jobs = JobSystem::new(JobSystemConfig::default().with_workers(1));

let mut escaped: Option<&JobContext<'_>> = None;
let job = jobs.create_job(|cx| {
    escaped = Some(cx); //~ ERROR
});

``` */
mod escaping_context {}
