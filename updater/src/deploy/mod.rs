//! Deployment module

pub mod fsm;
pub mod orchestrator;
pub mod resolver;
pub mod runner;
pub mod toolchain;
