//! Background workers

pub mod health;
