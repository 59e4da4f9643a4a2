//! infragent library
//!
//! Core modules of the provisioning orchestrator.

pub mod app;
pub mod cluster;
pub mod collect;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod recovery;
pub mod registry;
pub mod server;
pub mod storage;
pub mod templates;
pub mod utils;
pub mod workers;
