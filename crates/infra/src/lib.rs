//! Infrastructure layer: event store, dispatcher, settlement services,
//! projections, background workers and storage adapters.

pub mod command_dispatcher;
pub mod config;
pub mod event_store;
pub mod jobs;
pub mod notifications;
pub mod projections;
pub mod read_model;
pub mod settlement;
pub mod stock;
pub mod workers;

#[cfg(test)]
mod integration_tests;
