//! Core library for the `glab` command-line client: browser-based OAuth login,
//! token refresh, and per-host credential storage.

pub mod auth;
pub mod config;
