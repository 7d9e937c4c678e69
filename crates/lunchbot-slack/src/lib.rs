// Slack implementation of the lunch bot's chat gateway.

pub mod client;
pub mod reactions;

pub use client::{SlackClient, SlackSettings};
