//! Decision components for the join pipeline
//!
//! Each component is a pure step: exemption check, scoring, then policy
//! selection. None of them touch the platform or any store.

pub mod exemption;
pub mod policy_engine;
pub mod risk_scorer;

pub use exemption::{Exemption, ExemptionRegistry};
pub use policy_engine::{PolicyDecision, PolicyEngine, PolicyInput, PolicyRule};
pub use risk_scorer::RiskScorer;
