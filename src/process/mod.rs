//! Scoped process execution for subprocess-backed collectors
//!
//! Every process started here runs under an explicit time limit and is
//! killed if the caller stops waiting for it, whatever the reason.

mod command;
mod error;

pub use command::Command;
pub use error::{ProcessError, ProcessResult};
