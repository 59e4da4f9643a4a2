//! Local HTTP command and polling surface

pub mod error;
pub mod handlers;
pub mod serve;
pub mod state;
