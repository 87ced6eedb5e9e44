//! CLI command modules.

pub mod blacklist;
pub mod http;
pub mod jobs;
pub mod statistics;
pub mod status;
