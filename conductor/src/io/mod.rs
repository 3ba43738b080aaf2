//! Side-effecting adapters: processes, shell, git, filesystem, model transport.

pub mod completion;
pub mod config;
pub mod git;
pub mod process;
pub mod prompt;
pub mod shell;
pub mod workspace;
