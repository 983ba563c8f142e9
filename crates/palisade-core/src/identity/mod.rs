//! Multi-tenant identity: organizations, agents, and bearer tokens.
//!
//! Organizations own agents; an agent is scoped to exactly one organization.
//! Mutating endpoints are guarded by HMAC-signed bearer tokens whose claims
//! name the agent and organization; validation checks the signature in
//! constant time, the expiry, and that the pair is still active in the
//! registry. Agents may additionally hold a hashed API key as a long-lived
//! credential; key verification is constant-time as well.

mod store;
mod token;

pub use store::{hash_api_key, verify_api_key, Agent, IdentityError, IdentityStore, Organization};
pub use token::{Claims, TokenError, TokenMinter, DEFAULT_TOKEN_EXPIRY_SECS};
