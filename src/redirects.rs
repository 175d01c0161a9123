use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::error::{ExecError, Result};
use crate::line::Statement;

const OUTPUT_MODE: u32 = 0o777;

/// The two endpoints a statement's pipeline is connected to.
/// Opened files are closed when this is dropped; stdin and stdout never are.
#[derive(Debug, Default)]
pub struct Redirection {
    input: Option<File>,
    output: Option<File>,
}

impl Redirection {
    pub fn open(statement: &Statement) -> Result<Self> {
        let input = statement.input().map(open_input).transpose()?;
        let output = statement.output().map(open_output).transpose()?;
        Ok(Self { input, output })
    }

    pub fn input(&self) -> BorrowedFd<'_> {
        match &self.input {
            Some(file) => file.as_fd(),
            None => stdin_fd(),
        }
    }

    pub fn output(&self) -> BorrowedFd<'_> {
        match &self.output {
            Some(file) => file.as_fd(),
            None => stdout_fd(),
        }
    }
}

fn open_input(path: &Path) -> Result<File> {
    File::open(path).map_err(|source| ExecError::Redirect {
        path: path.to_path_buf(),
        source,
    })
}

fn open_output(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(OUTPUT_MODE)
        .open(path)
        .map_err(|source| ExecError::Redirect {
            path: path.to_path_buf(),
            source,
        })
}

pub fn stdin_fd() -> BorrowedFd<'static> {
    // SAFETY: descriptor 0 stays open for the life of the process.
    unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) }
}

pub fn stdout_fd() -> BorrowedFd<'static> {
    // SAFETY: descriptor 1 stays open for the life of the process.
    unsafe { BorrowedFd::borrow_raw(libc::STDOUT_FILENO) }
}
