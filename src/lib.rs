//! Vibely client: an optimistic query cache over the Vibely REST API, with a
//! realtime push channel feeding server changes into the same cache.

pub mod api;
pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod notice;
pub mod query;
pub mod realtime;
