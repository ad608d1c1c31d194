//! Data models

pub mod deployment;
pub mod event;
pub mod request;
