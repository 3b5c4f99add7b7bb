pub mod audit;
pub mod components;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod multi_identity;
pub mod pipeline;
pub mod platform;
pub mod raid;
pub mod signals;
pub mod store;
pub mod verification;

pub use audit::{AuditLog, AuditSink, MemoryAudit};
pub use config::{AppConfig, ConfigStore, InMemoryConfigStore, PolicyConfig};
pub use error::WardenError;
pub use model::{Identity, Membership, RiskAssessment, RiskLevel, SignalSet, Verdict};
pub use pipeline::{Collaborators, JoinOutcome, Pipeline};
pub use verification::{CaseState, DecisionType, VerificationCase};
