//! Mutation applier: replays edits against a sandbox tree.
//!
//! Edits come either from a pre-authored script ([`ScriptedStrategy`]) or
//! from an external decision-maker issuing one primitive action at a time
//! ([`AgenticStrategy`]). Both resolve every path inside the sandbox root
//! and apply edits strictly in the order they are produced.

pub mod agent;
pub mod config_patch;
pub mod ops;
pub mod path;
pub mod strategy;

pub use agent::{AgentAction, DecisionMaker, Observation, ProcessDecisionMaker, ScriptedDecisions};
pub use config_patch::ConfigFormat;
pub use ops::{replace_exact, EditApplier, EditOp};
pub use path::resolve_in_root;
pub use strategy::{
    AgenticStrategy, MutationStrategy, MutationSummary, ScriptedStrategy, StopReason,
};
