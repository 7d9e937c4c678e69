// WieBetaaltWat implementation of the lunch bot's ledger gateway.

pub mod client;

pub use client::{LedgerClient, WbwClient, WbwSettings};
