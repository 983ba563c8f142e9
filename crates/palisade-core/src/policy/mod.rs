//! Policy source, compilation, and engine integration.
//!
//! Operators author policies in a declarative YAML form. The compiler
//! transforms a policy set into the external policy engine's native rule
//! language under a stable package name; the content hash of the source
//! becomes the `policy_version` recorded on every decision. The adapter owns
//! the REST RPC with the engine and fails closed: if the engine is
//! unreachable, malformed, or slow, the decision is a denial.
//!
//! Rule semantics follow a **default-deny** model: rules evaluate in
//! declared order, any matching `deny` wins over `allow`s, and a manifest
//! matching no rule at all is denied.

pub mod adapter;
pub mod compiler;
pub mod source;

pub use adapter::{
    Decision, EngineTransport, HttpEngineTransport, PolicyEngineAdapter, TransportError,
    ENGINE_UNAVAILABLE_REASON, UNKNOWN_POLICY_VERSION,
};
pub use compiler::{compile_source, CompiledPolicy};
pub use source::{
    Condition, ParameterConstraint, Policy, PolicySet, PolicySourceError, Rule, RuleAction,
};
