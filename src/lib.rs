//! Authentication and credential lifecycle core for a multi-tenant tool gateway.
//!
//! - [`credentials`]: per-identity OAuth token storage (file or memory)
//! - [`retry`]: retry-on-stale-credential wrapper with token purging
//! - [`session`]: TTL and LRU bounded session-to-identity registry
//! - [`auth`]: per-request identity resolution
//! - [`probe`]: cached "does this endpoint require auth" checks
//! - [`guidance`]: user-facing auth error catalog
//!
//! [`AuthServices`] wires one instance of each together.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod guidance;
pub mod probe;
pub mod retry;
pub mod server;
pub mod session;
pub mod types;


pub use auth::{
    AuthMethod, AuthOutcome, RequestAuthState, RequestAuthenticator, TokenVerifier,
    TransportContext, VerifiedAuth, extract_bearer_token,
};
pub use config::GatewayAuthConfig;
pub use credentials::{
    CredentialStore, FileCredentialStore, MemoryCredentialStore, OAuthClientInfo, OAuthToken,
};
pub use error::{CredentialStoreError, GatewayError, StaleCredentialError};
pub use gateway::AuthServices;
pub use guidance::{AuthErrorGuidance, AuthErrorKind};
pub use probe::AuthProbe;
pub use retry::{RetryConfig, RetryError, RetryPolicy, is_stale_credential_error};
pub use server::serve;
pub use session::{BindOptions, SessionBinding, SessionRegistry, SessionStatus};
pub use types::{ClientId, Identity, SessionId};
