//! Storage module

pub mod layout;
pub mod settings;
pub mod state;
