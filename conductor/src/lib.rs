//! Multi-agent orchestration engine that turns a project description into code.
//!
//! A coordinator agent drafts requirements, plans phased tasks, and fans each
//! phase out to parallel worker agents. Every agent queries a language model,
//! parses the free-text reply into actions, and executes them against the
//! project's working directory. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (reply parsing, phase planning,
//!   completion rules). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (processes, shell, git, files,
//!   model transport, config, prompts). Isolated behind small types and traits
//!   so tests can substitute them.
//!
//! [`session`] and [`agents`] combine both into the agent state machines, all
//! sharing one [`registry`]. [`orchestrator`] is the library control surface.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
