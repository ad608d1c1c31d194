//! deployd Library
//!
//! Fetches a repository into an isolated workspace, installs, builds and
//! starts it, and streams the live log to any number of readers.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod utils;
pub mod workers;
