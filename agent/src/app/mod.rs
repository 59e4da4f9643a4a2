//! Application wiring and lifecycle

pub mod inspect;
pub mod options;
pub mod run;
pub mod state;
