//! Deterministic, pure logic shared by the attempt loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod commands;
pub mod parser;
pub mod state;
pub mod types;
pub mod verdict;
