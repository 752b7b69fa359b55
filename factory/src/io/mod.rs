//! Side effects: filesystem, git, subprocesses and the external collaborators.

pub mod agent;
pub mod atomic;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod gate1;
pub mod git;
pub mod holdout;
pub mod init;
pub mod iteration_log;
pub mod iteration_store;
pub mod nfr;
pub mod paths;
pub mod process;
pub mod review;
pub mod scenario_runner;
pub mod scenarios;
