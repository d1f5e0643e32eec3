#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod access;
pub mod allocate;
pub mod api;
pub mod backup;
pub mod cli;
pub mod config;
pub mod error;
pub mod guest;
pub mod locate;
pub mod logging;
pub mod paths;
pub mod progress;
pub mod task;
pub mod util;
