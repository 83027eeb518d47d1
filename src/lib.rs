//! Client for the Sesame voice service: anonymous identity, token lifecycle
//! and a full-duplex PCM voice session over WebSocket.

pub mod audio;
pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;

mod net_link;

pub use audio::AudioChunk;
pub use auth::{AuthClient, Credential, CredentialStore, IdentityService, TokenManager};
pub use config::Config;
pub use error::{AuthError, SessionError};
pub use session::{
    Character, DisconnectReason, SessionChannel, SessionInfo, SessionObserver, SessionState,
};
