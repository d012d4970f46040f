//! Autonomous tool-use loop driving a language model through a task.
//!
//! The model replies with one tag-delimited tool invocation per turn; the loop
//! parses it, asks the operator for approval where needed, executes it on the
//! host or in a container, and feeds the result back until the model calls
//! `attempt_completion`.
//!
//! - **[`core`]**: Pure logic (message model, tool protocol parser, tool
//!   contracts, result formatting, diff application). No I/O.
//! - **[`io`]**: Side effects (processes, containers, files, completion
//!   service, terminal prompts), each behind a seam that tests replace.
//!
//! [`dispatch`] and [`session`] combine the two into the task loop.

pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
