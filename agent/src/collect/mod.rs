//! Conversational parameter collection

pub mod coerce;
pub mod collector;
pub mod session;

pub use collector::{FreeformOutcome, ParameterCollector};
pub use session::{AnswerOutcome, CollectionSession, CollectionState};
