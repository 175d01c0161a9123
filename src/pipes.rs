use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, OFlag};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::config::StageScheduling;
use crate::error::{ExecError, Result};
use crate::line::{LineStatus, Pipeline, Stage};

/// Exit status of a stage whose exec failed.
pub const EXEC_FAILURE_STATUS: i32 = 255;

pub const COMMAND_NOT_FOUND: &[u8] = b"Error: command not found!\n";

/// Why `run_pipeline` came back instead of replacing the process image.
#[derive(Debug)]
pub enum PipelineFailure {
    /// The line already failed before this stage was reached.
    Aborted,
    Upstream(ExecError),
    Final(ExecError),
}

impl PipelineFailure {
    pub fn errno(&self) -> Errno {
        match self {
            PipelineFailure::Aborted => Errno::ECANCELED,
            PipelineFailure::Upstream(err) | PipelineFailure::Final(err) => err.errno(),
        }
    }
}

/// Write half of an exec report channel. Both halves are close-on-exec, so a
/// successful exec closes the writer and the watcher sees EOF.
pub struct ExecReporter(File);

pub struct ExecWatcher(File);

pub fn exec_channel() -> Result<(ExecWatcher, ExecReporter)> {
    let (read_end, write_end) = unistd::pipe2(OFlag::O_CLOEXEC)?;
    Ok((
        ExecWatcher(File::from(read_end)),
        ExecReporter(File::from(write_end)),
    ))
}

impl ExecReporter {
    pub fn report(mut self, errno: Errno) {
        let _ = self.0.write_all(&(errno as i32).to_ne_bytes());
    }
}

impl ExecWatcher {
    /// Blocks until the other side execs (None) or reports a failure.
    pub fn wait(mut self) -> Option<Errno> {
        let mut buf = [0u8; 4];
        match self.0.read_exact(&mut buf) {
            Ok(()) => Some(Errno::from_raw(i32::from_ne_bytes(buf))),
            Err(_) => None,
        }
    }
}

/// Program and argv prepared before fork, so children never allocate.
struct ExecPlan {
    program: String,
    argv: Vec<CString>,
}

impl ExecPlan {
    fn new(stage: &Stage) -> Result<Self> {
        let program = stage.program().ok_or(ExecError::EmptyStage)?.to_string();
        let argv = stage.argv().to_exec()?;
        Ok(Self { program, argv })
    }

    /// Returns only if exec failed.
    fn exec(&self) -> Errno {
        restore_default_signals();
        match unistd::execvp(&self.argv[0], &self.argv) {
            Ok(never) => match never {},
            Err(errno) => errno,
        }
    }

    fn failure(&self, errno: Errno) -> ExecError {
        ExecError::Exec {
            program: self.program.clone(),
            errno,
        }
    }
}

/// Runs `pipeline` from `input` to `output` inside the supervising process.
/// The final stage replaces the current process image, so this returns only
/// on failure. On any exec failure the fixed diagnostic goes to stdout and
/// `status` is marked.
pub fn run_pipeline(
    pipeline: &Pipeline,
    input: BorrowedFd<'_>,
    output: BorrowedFd<'_>,
    status: &mut LineStatus,
    scheduling: StageScheduling,
) -> PipelineFailure {
    let Some((last, upstream)) = pipeline.stages().split_last() else {
        return PipelineFailure::Final(ExecError::EmptyStage);
    };

    let mut carried: Option<OwnedFd> = None;
    for stage in upstream {
        if status.error_occurred() {
            return PipelineFailure::Aborted;
        }
        let stage_input = carried.as_ref().map_or(input, |fd| fd.as_fd());
        match start_stage(stage, stage_input, scheduling) {
            Ok(read_end) => carried = Some(read_end),
            Err(err) => {
                announce_not_found();
                status.mark_error();
                return PipelineFailure::Upstream(err);
            }
        }
    }

    let stage_input = carried.as_ref().map_or(input, |fd| fd.as_fd());
    let err = match ExecPlan::new(last) {
        Ok(plan) => {
            let errno = exec_in_place(&plan, stage_input, output);
            plan.failure(errno)
        }
        Err(err) => {
            announce_not_found();
            err
        }
    };
    status.mark_error();
    PipelineFailure::Final(err)
}

/// Spawns one upstream stage writing into a fresh pipe and returns the
/// pipe's read end for the next stage.
fn start_stage(
    stage: &Stage,
    input: BorrowedFd<'_>,
    scheduling: StageScheduling,
) -> Result<OwnedFd> {
    let plan = ExecPlan::new(stage)?;
    let (read_end, write_end) = unistd::pipe2(OFlag::O_CLOEXEC)?;
    let child = spawn_stage(&plan, input, write_end.as_fd())?;
    drop(write_end);

    if scheduling == StageScheduling::Sequential {
        if let WaitStatus::Signaled(_, signal, _) = waitpid(child, None)? {
            return Err(ExecError::Killed {
                program: plan.program,
                signal,
            });
        }
    }
    Ok(read_end)
}

/// Forks and execs `plan` with the given stdin/stdout. Returns once the child
/// has exec'd, or with the child's exec error after reaping it.
fn spawn_stage(plan: &ExecPlan, input: BorrowedFd<'_>, output: BorrowedFd<'_>) -> Result<Pid> {
    let (watcher, reporter) = exec_channel()?;

    // SAFETY: the child only rewires descriptors and execs, or exits.
    match unsafe { unistd::fork() }? {
        ForkResult::Child => {
            drop(watcher);
            let errno = match attach_stdio(input, output) {
                Ok(()) => plan.exec(),
                Err(errno) => errno,
            };
            reporter.report(errno);
            // SAFETY: skips atexit handlers and stdio buffers copied from the parent.
            unsafe { libc::_exit(EXEC_FAILURE_STATUS) }
        }
        ForkResult::Parent { child } => {
            drop(reporter);
            match watcher.wait() {
                None => Ok(child),
                Some(errno) => {
                    let _ = waitpid(child, None);
                    Err(plan.failure(errno))
                }
            }
        }
    }
}

/// Execs the final stage in the current process. On failure stdout is put
/// back before the diagnostic is written.
fn exec_in_place(plan: &ExecPlan, input: BorrowedFd<'_>, output: BorrowedFd<'_>) -> Errno {
    let saved_stdout = save_stdout().ok();
    let errno = match attach_stdio(input, output) {
        Ok(()) => plan.exec(),
        Err(errno) => errno,
    };
    if let Some(saved) = saved_stdout {
        let _ = unistd::dup2_stdout(&saved);
    }
    announce_not_found();
    errno
}

/// Close-on-exec copy of stdout, above the standard descriptors.
fn save_stdout() -> nix::Result<OwnedFd> {
    let raw = fcntl::fcntl(io::stdout(), FcntlArg::F_DUPFD_CLOEXEC(3))?;
    // SAFETY: `raw` was just returned by fcntl and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn attach_stdio(input: BorrowedFd<'_>, output: BorrowedFd<'_>) -> nix::Result<()> {
    if input.as_raw_fd() != libc::STDIN_FILENO {
        unistd::dup2_stdin(input)?;
    }
    if output.as_raw_fd() != libc::STDOUT_FILENO {
        unistd::dup2_stdout(output)?;
    }
    Ok(())
}

fn restore_default_signals() {
    for sig in [Signal::SIGINT, Signal::SIGPIPE] {
        // SAFETY: installing the default disposition runs no handler code.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
}

fn announce_not_found() {
    let _ = unistd::write(io::stdout(), COMMAND_NOT_FOUND);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::InputLine;
    use std::fs;

    fn stage(words: &[&str]) -> InputLine {
        let mut line = InputLine::new();
        for word in words {
            line.append_argument(word, false);
        }
        line
    }

    fn read_all(fd: OwnedFd) -> String {
        let mut out = String::new();
        File::from(fd).read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn upstream_stage_output_arrives_on_read_end() {
        let line = stage(&["printf", "one\ntwo\n"]);
        let dir = tempfile::tempdir().unwrap();
        let input = File::create(dir.path().join("empty")).unwrap();

        let read_end = start_stage(
            line.statements()[0].current_stage(),
            input.as_fd(),
            StageScheduling::Concurrent,
        )
        .unwrap();
        assert_eq!(read_all(read_end), "one\ntwo\n");
    }

    #[test]
    fn stages_chain_through_carried_read_end() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, "b\nc\na\n").unwrap();
        let input = File::open(&src).unwrap();

        let sort = stage(&["sort"]);
        let head = stage(&["head", "-n", "2"]);
        let first = start_stage(
            sort.statements()[0].current_stage(),
            input.as_fd(),
            StageScheduling::Sequential,
        )
        .unwrap();
        let second = start_stage(
            head.statements()[0].current_stage(),
            first.as_fd(),
            StageScheduling::Sequential,
        )
        .unwrap();
        drop(first);
        assert_eq!(read_all(second), "a\nb\n");
    }

    #[test]
    fn missing_program_reports_exec_error() {
        let line = stage(&["pipesh-test-no-such-program"]);
        let dir = tempfile::tempdir().unwrap();
        let input = File::create(dir.path().join("empty")).unwrap();

        match start_stage(
            line.statements()[0].current_stage(),
            input.as_fd(),
            StageScheduling::Concurrent,
        ) {
            Err(ExecError::Exec { program, errno }) => {
                assert_eq!(program, "pipesh-test-no-such-program");
                assert_eq!(errno, Errno::ENOENT);
            }
            other => panic!("expected exec error, got {other:?}"),
        }
    }

    #[test]
    fn program_exiting_255_is_not_an_exec_failure() {
        let line = stage(&["sh", "-c", "exit 255"]);
        let dir = tempfile::tempdir().unwrap();
        let input = File::create(dir.path().join("empty")).unwrap();

        let read_end = start_stage(
            line.statements()[0].current_stage(),
            input.as_fd(),
            StageScheduling::Sequential,
        );
        assert!(read_end.is_ok());
    }

    #[test]
    fn empty_stage_is_rejected_before_fork() {
        let mut line = InputLine::new();
        line.append_statement(false);
        let dir = tempfile::tempdir().unwrap();
        let input = File::create(dir.path().join("empty")).unwrap();

        let result = start_stage(
            line.statements()[0].current_stage(),
            input.as_fd(),
            StageScheduling::Concurrent,
        );
        assert!(matches!(result, Err(ExecError::EmptyStage)));
    }

    #[test]
    fn aborted_when_line_already_failed() {
        let mut line = stage(&["true"]);
        line.append_stage();
        line.append_argument("true", false);
        let mut status = LineStatus::default();
        status.mark_error();

        let failure = run_pipeline(
            line.statements()[0].pipeline(),
            crate::redirects::stdin_fd(),
            crate::redirects::stdout_fd(),
            &mut status,
            StageScheduling::Concurrent,
        );
        assert!(matches!(failure, PipelineFailure::Aborted));
    }

    #[test]
    fn saved_stdout_is_close_on_exec() {
        let saved = save_stdout().unwrap();
        assert!(saved.as_raw_fd() > libc::STDERR_FILENO);
        let flags = fcntl::fcntl(&saved, FcntlArg::F_GETFD).unwrap();
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn watcher_sees_eof_when_reporter_dropped() {
        let (watcher, reporter) = exec_channel().unwrap();
        drop(reporter);
        assert_eq!(watcher.wait(), None);

        let (watcher, reporter) = exec_channel().unwrap();
        reporter.report(Errno::EACCES);
        assert_eq!(watcher.wait(), Some(Errno::EACCES));
    }
}
