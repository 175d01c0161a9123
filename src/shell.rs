use std::env;
use std::io::{self, BufRead, IsTerminal, Write};
use std::os::fd::{AsFd, BorrowedFd};

use colored::Colorize;
use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd;

use crate::command;
use crate::config::Settings;
use crate::diag::{self, debug};
use crate::error::Result;
use crate::jobs::{self, JobOutcome, JobTable};
use crate::line::{InputLine, LineStatus, Statement};
use crate::redirects::Redirection;

/// Status reported for a statement whose program could not be exec'd.
const NOT_FOUND_STATUS: i32 = 127;

pub struct Shell {
    settings: Settings,
    line: InputLine,
    jobs: JobTable,
    user: String,
    last_status: i32,
}

impl Shell {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            line: InputLine::new(),
            jobs: JobTable::new(),
            user: whoami::username(),
            last_status: 0,
        }
    }

    /// Reads lines from stdin until EOF or `exit`. Returns the last status.
    pub fn run(&mut self) -> i32 {
        // SAFETY: ignoring a signal installs no handler code.
        if let Err(e) = unsafe { signal::signal(Signal::SIGINT, SigHandler::SigIgn) } {
            diag::error(format_args!("cannot ignore SIGINT: {}", e));
        }

        let stdin = io::stdin();
        let interactive = stdin.is_terminal();
        let mut buf = String::new();

        loop {
            self.report_finished_jobs();

            if interactive {
                print!("{}", self.prompt());
                let _ = io::stdout().flush();
            }

            buf.clear();
            let read = if interactive {
                stdin.lock().read_line(&mut buf).map(|n| n > 0)
            } else {
                read_script_line(stdin.as_fd(), &mut buf).map_err(io::Error::from)
            };
            match read {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) => {
                    diag::error(format_args!("error reading input: {}", e));
                    break;
                }
            }

            if !self.execute(&buf) {
                break;
            }
        }

        self.last_status
    }

    /// Parses and runs one line. Returns false once the line asked to exit.
    pub fn execute(&mut self, text: &str) -> bool {
        self.line.start_new_line();
        if let Err(e) = command::parse_line(text, &mut self.line) {
            diag::error(format_args!("syntax error: {}", e));
            self.line.start_new_line();
            self.last_status = 2;
            return true;
        }

        debug!("parsed {} statement(s)", self.line.len());
        if !self.line.is_empty() {
            self.last_status = run_line(&mut self.line, &self.settings, &mut self.jobs);
        }
        !self.line.exit_requested()
    }

    pub fn last_status(&self) -> i32 {
        self.last_status
    }

    /// `user:cwd $ `, with the last status shown when it is not zero.
    fn prompt(&self) -> String {
        let cwd = env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| String::from("?"));
        let status = if self.last_status == 0 {
            String::new()
        } else {
            format!(" [{}]", self.last_status).red().to_string()
        };
        format!("{}:{}{} $ ", self.user.green().bold(), cwd.blue(), status)
    }

    fn report_finished_jobs(&mut self) {
        for (job, status) in self.jobs.reap() {
            debug!("job {} ({}) ended with {:?}", job.id, job.pid, status);
            println!("[{}] Done {}", job.id, job.command);
        }
    }
}

/// Reads one line a byte at a time so that whatever follows it stays unread
/// for the programs the line starts. Returns false at EOF.
fn read_script_line(fd: BorrowedFd<'_>, buf: &mut String) -> nix::Result<bool> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match unistd::read(fd, &mut byte) {
            Ok(0) => break,
            Ok(_) => {
                bytes.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            Err(Errno::EINTR) => {}
            Err(e) => return Err(e),
        }
    }
    buf.push_str(&String::from_utf8_lossy(&bytes));
    Ok(!bytes.is_empty())
}

/// Runs every statement of `line` in order until one fails. Returns the
/// status of the last statement that ran.
pub fn run_line(line: &mut InputLine, settings: &Settings, jobs: &mut JobTable) -> i32 {
    if line.status().error_occurred() {
        return 1;
    }

    let (statements, status) = line.parts_mut();
    let mut last_status = 0;
    for statement in statements {
        if status.error_occurred() {
            break;
        }
        match run_statement(statement, *status, settings) {
            Ok(JobOutcome::Finished(wait_status)) => last_status = exit_code(wait_status),
            Ok(JobOutcome::Background(pid)) => {
                let id = jobs.add(pid, statement.to_string());
                println!("[{}] {}", id, pid);
                last_status = 0;
            }
            Ok(JobOutcome::Failed(errno)) => {
                debug!("`{}` failed to start: {}", statement, errno.desc());
                status.mark_error();
                last_status = NOT_FOUND_STATUS;
            }
            Err(err) => {
                diag::error(&err);
                status.mark_error();
                last_status = 1;
            }
        }
    }
    last_status
}

/// Opens the statement's redirections and runs its pipeline as a job. The
/// opened files are closed on return.
pub fn run_statement(
    statement: &Statement,
    status: LineStatus,
    settings: &Settings,
) -> Result<JobOutcome> {
    let redirection = Redirection::open(statement)?;
    debug!(
        "running `{}` ({} stage(s), {:?})",
        statement,
        statement.pipeline().len(),
        settings.scheduling
    );
    // Anything still buffered would otherwise be written twice.
    io::stdout().flush()?;
    jobs::run_as_job(
        statement.pipeline(),
        redirection.input(),
        redirection.output(),
        statement.background(),
        status,
        settings.scheduling,
    )
}

fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    }
}
