//! Trust signal collection for newly joined identities.

pub mod bans;
pub mod collector;
pub mod username;

pub use bans::{BanLookup, BanPage, BanRecord, CaseHistoryBanLookup, NoBanLookup};
pub use collector::SignalCollector;
pub use username::{KeywordUsernameStrategy, UsernameSuspicionStrategy, UsernameVerdict};
