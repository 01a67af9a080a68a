//! ESPHome Selective Updater Library
//!
//! Decides which devices of an ESPHome fleet need new firmware, compiles and
//! uploads them one at a time, and journals every outcome so an interrupted
//! run resumes where it stopped.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod filter;
pub mod inventory;
pub mod journal;
pub mod logs;
pub mod models;
pub mod shutdown;
pub mod storage;
pub mod utils;
