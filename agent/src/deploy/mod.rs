//! Deployment execution and tracking

pub mod executor;
pub mod fsm;
pub mod markers;
pub mod output;
pub mod state;
pub mod tool;
pub mod tracker;
