//! Globus backend for Archeion.
//!
//! This module provides:
//! - Globus Auth native-app OAuth2 flow (PKCE, offline refresh tokens)
//! - A Globus Transfer API v0.10 client implementing `TransferService`

pub mod auth;
pub mod client;

pub use auth::{AuthConfig, GlobusAuth};
pub use client::{GlobusClient, GlobusConfig};
