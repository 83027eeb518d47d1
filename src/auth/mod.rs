//! Anonymous identity: wire client, persisted credential and the token lifecycle on top.

pub mod client;
pub mod mock;
pub mod models;
pub mod store;
pub mod token_manager;

pub use client::{AuthClient, IdentityService};
pub use models::{AccountInfo, Credential};
pub use store::CredentialStore;
pub use token_manager::TokenManager;
