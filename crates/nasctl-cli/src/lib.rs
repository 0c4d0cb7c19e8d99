//! nasctl command-line interface
//!
//! Every remote command goes through the shared background daemon, which is
//! launched from this same binary (`nasctl daemon run`) on first use.

pub mod cli;
pub mod commands;
pub mod config;
pub mod output;
