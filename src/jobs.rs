use std::collections::BTreeMap;
use std::os::fd::BorrowedFd;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::config::StageScheduling;
use crate::diag;
use crate::error::Result;
use crate::line::{LineStatus, Pipeline};
use crate::pipes::{self, ExecReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The supervisor exec'd the final stage and has since terminated.
    Finished(WaitStatus),
    /// A stage could not be exec'd.
    Failed(Errno),
    /// Not waited on; the supervisor is still running.
    Background(Pid),
}

/// Forks the supervising process for one statement's pipeline. A foreground
/// job blocks until the supervisor terminates; a background job returns at once.
pub fn run_as_job(
    pipeline: &Pipeline,
    input: BorrowedFd<'_>,
    output: BorrowedFd<'_>,
    background: bool,
    status: LineStatus,
    scheduling: StageScheduling,
) -> Result<JobOutcome> {
    let channel = if background {
        None
    } else {
        Some(pipes::exec_channel()?)
    };

    // SAFETY: the child runs the pipeline and never returns into the caller.
    match unsafe { unistd::fork() }? {
        ForkResult::Child => {
            let reporter = channel.map(|(watcher, reporter)| {
                drop(watcher);
                reporter
            });
            supervise(pipeline, input, output, status, scheduling, reporter)
        }
        ForkResult::Parent { child } => {
            let Some((watcher, reporter)) = channel else {
                return Ok(JobOutcome::Background(child));
            };
            drop(reporter);
            let failure = watcher.wait();
            let wait_status = waitpid(child, None)?;
            Ok(match failure {
                Some(errno) => JobOutcome::Failed(errno),
                None => JobOutcome::Finished(wait_status),
            })
        }
    }
}

fn supervise(
    pipeline: &Pipeline,
    input: BorrowedFd<'_>,
    output: BorrowedFd<'_>,
    mut status: LineStatus,
    scheduling: StageScheduling,
    reporter: Option<ExecReporter>,
) -> ! {
    let failure = pipes::run_pipeline(pipeline, input, output, &mut status, scheduling);
    if let Some(reporter) = reporter {
        reporter.report(failure.errno());
    }
    // SAFETY: the supervisor's stdio buffers belong to the interpreter.
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

#[derive(Debug)]
pub struct Job {
    pub id: u32,
    pub pid: Pid,
    pub command: String,
}

/// Background supervisors that have not been reaped yet.
#[derive(Debug)]
pub struct JobTable {
    jobs: BTreeMap<u32, Job>,
    next_id: u32,
}

impl JobTable {
    pub fn new() -> Self {
        Self {
            jobs: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn add(&mut self, pid: Pid, command: String) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.jobs.insert(id, Job { id, pid, command });
        id
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    #[allow(dead_code)]
    pub fn list(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Collects every job that has terminated since the last call.
    pub fn reap(&mut self) -> Vec<(Job, WaitStatus)> {
        let mut done = Vec::new();
        for (id, job) in &self.jobs {
            match waitpid(job.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => done.push((*id, status)),
                Err(Errno::ECHILD) => done.push((*id, WaitStatus::StillAlive)),
                Err(e) => diag::error(format_args!("job {}: {}", id, e)),
            }
        }

        done.into_iter()
            .filter_map(|(id, status)| self.jobs.remove(&id).map(|job| (job, status)))
            .collect()
    }
}
