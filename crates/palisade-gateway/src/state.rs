//! Process-wide shared state.
//!
//! Built once at startup and cloned into every handler. The signing key and
//! token secret are read-only after initialization; the policy-version
//! cache inside the adapter swaps atomically on reload; the database
//! connection is shared behind the ledger's handle.

use std::sync::Arc;

use tokio::sync::Semaphore;

use palisade_core::config::GatewayConfig;
use palisade_core::identity::{IdentityStore, TokenMinter};
use palisade_core::ledger::AuditLedger;
use palisade_core::policy::PolicyEngineAdapter;
use palisade_core::seal::SealEngine;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<GatewayConfig>,

    /// The audit ledger.
    pub ledger: AuditLedger,

    /// Organization and agent registry, layered on the ledger's database.
    pub identity: IdentityStore,

    /// Policy engine adapter.
    pub adapter: Arc<PolicyEngineAdapter>,

    /// Seal issuance engine.
    pub seals: Arc<SealEngine>,

    /// Bearer-token minter.
    pub tokens: Arc<TokenMinter>,

    /// Permit gate bounding concurrent in-flight validate requests.
    pub validate_permits: Arc<Semaphore>,
}

impl AppState {
    /// Assembles state from constructed components.
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        ledger: AuditLedger,
        adapter: PolicyEngineAdapter,
        seals: SealEngine,
        tokens: TokenMinter,
    ) -> Self {
        let identity = IdentityStore::new(ledger.handle());
        let validate_permits = Arc::new(Semaphore::new(config.server.max_in_flight_validates));

        Self {
            config: Arc::new(config),
            ledger,
            identity,
            adapter: Arc::new(adapter),
            seals: Arc::new(seals),
            tokens: Arc::new(tokens),
            validate_permits,
        }
    }
}
