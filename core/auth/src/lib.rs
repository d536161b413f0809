//! Archeion authorization layer.
//!
//! Drives the OAuth2 authorization-code flow, keeps the resulting tokens
//! fresh and hands out authorized capabilities to the transfer layer.

pub mod capability;
pub mod prompt;
pub mod session;
pub mod token;

pub use capability::{IdentityCapability, TransferCapability};
pub use prompt::{ConsolePrompt, Prompt, ScriptedPrompt};
pub use session::{AuthSession, SessionConfig};
pub use token::{StoredTokens, TokenStore};
