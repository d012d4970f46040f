//! Side-effecting operations: processes, containers, files, network, terminal.

pub mod approval;
pub mod completion;
pub mod config;
pub mod container;
pub mod environment;
pub mod files;
pub mod interrupt;
pub mod process;
pub mod prompt;
pub mod transcript;
pub mod workspace;
