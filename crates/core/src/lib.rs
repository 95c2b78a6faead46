//! Chains of child processes wired together by kernel pipes.
//!
//! A [`Command`] names an executable and maps child descriptor numbers to
//! typed endpoints. Connecting an output endpoint of one command to an input
//! endpoint of another forms an edge; launching a command turns its edges
//! into real pipes, duplicates every mapped descriptor onto its child-side
//! number, closes everything else, and reports pre-exec failures through a
//! close-on-exec error channel. Either command on an edge may launch first.
//!
//! ```no_run
//! use pipework::{Command, InputEndpoint};
//!
//! # fn main() -> pipework::Result<()> {
//! let mut producer = Command::new(["/bin/echo", "hello world"])?;
//! let mut consumer = Command::new(["/usr/bin/grep", "hello"])?;
//!
//! // Standalone endpoints must outlive the launch: edges never keep their
//! // peers alive.
//! let parent_stdout = InputEndpoint::real_fd(1);
//!
//! producer.bind_output(1, &consumer.input(0))?;
//! consumer.bind_output(1, &parent_stdout)?;
//!
//! consumer.run()?;
//! producer.run()?;
//! producer.wait()?;
//! consumer.wait()?;
//! # Ok(())
//! # }
//! ```

mod command;
mod endpoint;
mod error;
mod launch;

pub use command::Command;
pub use endpoint::{InputEndpoint, OutputEndpoint};
pub use error::{Error, Result};
pub use nix::{sys::wait::WaitStatus, unistd::Pid};
