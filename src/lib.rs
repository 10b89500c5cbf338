//! jobsh - a remote job shell.
//!
//! Each session is a long-lived POSIX shell behind a PTY. Clients submit
//! commands as jobs, poll their output incrementally by cursor, and can
//! watch everything the shell prints over a live stream.

pub mod activity;
pub mod api;
pub mod broker;
pub mod config;
pub mod error;
pub mod frame;
pub mod history;
pub mod job;
pub mod output;
pub mod pty;
pub mod scheduler;
pub mod session;
