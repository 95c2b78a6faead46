use std::os::fd::RawFd;

use nix::errno::Errno;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while wiring or launching commands.
#[derive(Debug, Error)]
pub enum Error {
    /// A command needs at least a program path.
    #[error("command requires at least one argument")]
    EmptyArgv,

    #[error("argument contains an interior NUL byte")]
    NulArgument(#[from] std::ffi::NulError),

    /// The endpoint at this child descriptor already carries an edge.
    #[error("endpoint at descriptor {0} is already connected")]
    PipeSetTwice(RawFd),

    /// An endpoint exists at this child descriptor but nothing is connected
    /// to it.
    #[error("endpoint at descriptor {0} is not connected")]
    PipeNotSet(RawFd),

    #[error("command has already been run")]
    CommandAlreadyRun,

    #[error("command is not running")]
    CommandNotRunning,

    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// The endpoint on the far side of an edge was dropped before launch.
    #[error("peer endpoint no longer exists")]
    EndpointDropped,

    /// The child reported a failed setup step through the error channel.
    #[error("child setup step {step} failed: {errno}")]
    ChildSetup { errno: Errno, step: String },

    /// A parent-side system call failed.
    #[error("{0}: {1}")]
    Sys(&'static str, Errno),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
