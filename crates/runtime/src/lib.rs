//! Sandboxed block interpreter for Codebox.
//!
//! Every isolation variant executes code blocks with the same interpreter
//! core, so a block behaves identically no matter where it runs:
//!
//! ```text
//! ┌──────────────────────────┐      ┌──────────────────────────────┐
//! │ in-process backend       │      │ container / remote sandbox   │
//! │   Interpreter::run       │      │   codebox-runner <job.json>  │
//! │   + ChannelPort (direct) │      │   Interpreter::run           │
//! └────────────┬─────────────┘      │   + TcpQueryPort ──► bridge  │
//!              │                    └──────────────┬───────────────┘
//!              ▼                                   ▼
//!      capability set (print, math, string, table, json, files,
//!      llm_query, llm_query_batched, show_vars, final_var)
//! ```
//!
//! The interpreter is an embedded Lua 5.4 VM created with only the math,
//! string, table and utf8 libraries. Code runs in a fresh environment table
//! holding exactly the enabled capabilities, so `load`, `require`, `io`,
//! `os` and `debug` are unreachable by construction.

pub mod capability;
pub mod convert;
pub mod files;
pub mod interpreter;
pub mod job;
pub mod port;

pub use capability::{Capability, CapabilitySet};
pub use interpreter::{Execution, Interpreter, Interrupt, Limits};
pub use job::{parse_outcome, run_job, run_job_file, RunnerJob, RunnerOutcome, OUTCOME_MARKER};
pub use port::{NullPort, QueryPort, TcpQueryPort};
