//! task-harbor: sandboxed task verification harness.
//!
//! Loads task bundles, provisions an isolated sandbox per run, applies a
//! reference solution or an agent's edits, and reduces the resulting tree
//! to a binary reward written to a fixed file.

// Core modules
pub mod bundle;
pub mod cli;
pub mod error;
pub mod harness;
pub mod metrics;
pub mod mutation;
pub mod sandbox;
pub mod verifier;

// Re-export commonly used types
pub use bundle::{list_bundles, load_bundle, TaskBundle};
pub use error::{
    AgentError, BundleError, ConfigError, EditError, HarnessError, SandboxError, VerifierError,
};
pub use harness::{Harness, HarnessConfig, RunMode, RunOutcome, RunReport, SelfCheckReport};
pub use mutation::{EditOp, MutationStrategy};
pub use sandbox::{Isolation, SandboxHandle, SandboxRuntime};
pub use verifier::{read_reward, Verifier};
