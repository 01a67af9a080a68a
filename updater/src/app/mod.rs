//! Application module

pub mod housekeeping;
pub mod options;
pub mod run;
