//! Persistent configuration and directory layout

pub mod layout;
pub mod settings;
