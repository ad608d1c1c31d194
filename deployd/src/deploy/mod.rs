//! Deployment engine

pub mod broadcaster;
pub mod fsm;
pub mod git;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod workspace;
