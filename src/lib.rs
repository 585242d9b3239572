//! lead_qualifier: conversational lead qualification for a renovation CRM
//!
//! An inbound chat message is stored, relevant knowledge is retrieved, and a
//! language model answers the client while extracting structured data and
//! suggesting a pipeline status. The engine merges those suggestions into
//! the lead under strict rules: operator edits win, statuses only move
//! forward, and each message is merged at most once.

pub mod chunk;
pub mod commands;
pub mod complete;
pub mod config;
pub mod db;
pub mod embed;
pub mod engine;
pub mod error;
pub mod fields;
pub mod knowledge;
pub mod models;
pub mod notify;
pub mod progress;
pub mod prompt;
pub mod provider;
pub mod retrieve;
pub mod store;
pub mod sweep;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
