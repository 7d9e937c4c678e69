// Library root for the lunch bot core: venue selection, chat polls and
// settlement of the resulting meal cost.

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod messages;
pub mod model;
pub mod orchestrator;
pub mod poll;
pub mod selection;
pub mod settlement;

pub use error::{LunchError, Result};
