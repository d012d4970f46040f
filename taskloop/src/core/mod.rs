//! Deterministic, pure logic shared by the agent loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod diff;
pub mod list_literal;
pub mod message;
pub mod output;
pub mod parser;
pub mod tools;
