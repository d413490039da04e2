//! Request authentication.
//!
//! [`RequestAuthenticator`] turns a [`TransportContext`] (headers, session
//! id, transport kind) into a [`RequestAuthState`]. Bearer tokens are checked
//! through the [`TokenVerifier`] seam:
//!
//! - [`JwksTokenVerifier`] for RS256 JWTs signed by a JWKS-published key
//! - [`GoogleTokenInfoVerifier`] for opaque Google access tokens
//! - [`ProviderVerifier`] to route between them by token shape

mod authenticator;
mod bearer;
pub mod jwks;
mod verifier;

pub use authenticator::{
    AuthMethod, AuthOutcome, AuthenticatedRequest, AuthenticatorConfig, RequestAuthState,
    RequestAuthenticator, TokenMetadata, TransportContext, UnverifiedCredential,
};
pub use bearer::{
    MAX_TOKEN_LEN, MIN_TOKEN_LEN, TokenProvider, decode_unverified_claims, extract_bearer_token,
    token_fingerprint,
};
pub use jwks::{JwksCache, JwksError, JwksTokenVerifier};
pub use verifier::{
    GOOGLE_TOKENINFO_URL, GoogleTokenInfoVerifier, ProviderVerifier, TokenVerifier, VerifiedAuth,
    VerifyError,
};
