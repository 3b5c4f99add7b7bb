//! Verification case lifecycle: states, admin commands, approval timers and
//! the state machine tying them together.

pub mod commands;
pub mod machine;
pub mod state;
pub mod timers;

pub use commands::{AdminCommand, CommandTable, DecisionType};
pub use machine::{DecisionOutcome, RecoveryReport, VerdictInput, VerificationStateMachine};
pub use state::{CaseState, DecisionRecord, VerificationCase, SYSTEM_ACTOR, TIMER_ACTOR};
pub use timers::{TimerEvents, TimerFired, TimerScheduler};
