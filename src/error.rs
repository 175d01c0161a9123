use std::ffi::NulError;
use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("{}: {source}", .path.display())]
    Redirect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{program}: {}", .errno.desc())]
    Exec { program: String, errno: Errno },

    #[error("{program}: killed by {signal:?}")]
    Killed { program: String, signal: Signal },

    #[error("empty command in pipeline")]
    EmptyStage,

    #[error("argument contains a nul byte: {0}")]
    Nul(#[from] NulError),

    #[error("system call failed: {0}")]
    Sys(#[from] Errno),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;

impl ExecError {
    /// Errno carried over the exec report channel for this failure.
    pub fn errno(&self) -> Errno {
        match self {
            ExecError::Exec { errno, .. } | ExecError::Sys(errno) => *errno,
            ExecError::Nul(_) | ExecError::EmptyStage => Errno::EINVAL,
            ExecError::Killed { .. } => Errno::ECHILD,
            ExecError::Redirect { source, .. } | ExecError::Io(source) => source
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO),
        }
    }
}
