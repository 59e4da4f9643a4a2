//! Post-deployment cluster discovery and connection caching

pub mod cache;
pub mod connector;
pub mod credentials;
pub mod discovery;
