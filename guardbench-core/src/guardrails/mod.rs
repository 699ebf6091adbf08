//! Guardrail synthesis.
//!
//! Turns failing-criterion judge feedback into a small set of executable
//! imperative rules, injects them into the original prompt, and replays
//! the target model to produce a before/after artifact.

pub mod feedback;
pub mod rules;
pub mod synthesis;

pub use feedback::{extract_reliable_feedback, JudgeFeedback, ReliableFeedback};
pub use synthesis::{build_injected_prompt, GuardrailSynthesiser};
