//! Accounts domain module (riders and operators).
//!
//! Plain business state and the events announcing it. No IO and no storage:
//! entities are persisted through a unit of work in `commitbox-infra`.

pub mod account;
pub mod profile;

pub use account::{AccountKind, Operator, OperatorRegistered, ProfileUpdated, Rider, RiderRegistered};
pub use profile::AccountProfile;
