//! Models of the agent's HTTP command and polling API

pub mod models;

pub use models::*;
