//! Skein CmdFs - commands served as a file tree.
//!
//! ```text
//! /Ctl                    operation counters
//! /<env>/                 one environment
//! /<env>/vars/<name>      one variable
//! /<env>/<cmd>/           one command: cmd in out err pout perr sts wait sig
//! ```
//!
//! Making a directory at the root creates an environment, seeded with the
//! host's variables and its own working directory. Making a directory
//! inside an environment creates a command; writing its `cmd` file runs
//! the script once, with a copy of the environment's variables and working
//! directory and fresh standard I/O. Removing a command kills it; removing
//! an environment kills every command in it.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod cmd;
pub mod config;
pub mod ctl;
pub mod env;
pub mod error;
pub mod interp;
pub mod node;
pub mod policy;
mod root;
pub mod tree;

pub use cmd::{Cmd, CmdFileId, CMD_FILES};
pub use config::CmdFsConfig;
pub use ctl::{Op, OpStats, TreeStats, CTL_NAME};
pub use env::{Env, DOT_VAR, VARS_NAME};
pub use error::FsError;
pub use interp::{Child, Interp, Job, ShellInterp, Sig, Status};
pub use node::{Caps, Node};
pub use policy::{AllowAll, Policy, UnixPolicy, Who};
pub use tree::{clean_path, path_elems, Tree};
