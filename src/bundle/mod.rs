//! Task bundles: the immutable description of one exercise.
//!
//! A bundle is a directory with a fixed layout:
//!
//! ```text
//! task.yaml            metadata, timeouts, verifier settings
//! instruction.md       what the agent is asked to do
//! solution/edits.yaml  structured reference edits (or solution/solve.sh)
//! tests/test.sh        verification entry point
//! environment/         base project tree
//! ```

pub mod loader;
pub mod types;

pub use loader::{list_bundles, load_bundle, BundleEntry, BundleIter, BundleListing};
pub use types::{
    AgentSpec, Difficulty, EnvironmentSpec, ReferenceSolution, SolutionSpec, TaskBundle,
    TaskConfig, TaskMetadata, VerifierSpec,
};
