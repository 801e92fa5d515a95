//! Process execution layer
//!
//! This module contains the command runner used for every external tool and
//! the per-job work directory management.

mod process;
mod workspace;

pub use process::{
    CommandError, CommandOutput, CommandRunner, DEFAULT_COMMAND_TIMEOUT, MAX_CAPTURED_BYTES,
    ProcessCommand, ProcessRunner,
};
pub(crate) use process::keep_tail;
pub use workspace::{BuildContext, Workspace, recreate_dir};
