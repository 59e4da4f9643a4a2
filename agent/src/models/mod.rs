//! Domain models

pub mod cluster;
pub mod deployment;
pub mod failure;
pub mod parameter;
