//! Identity records and verification lifecycle states.
//!
//! An [`Identity`] represents one person's verification attempt and current
//! trust state. It is created once on registration and mutated only through
//! [`crate::machine::VerificationStateMachine`] operations; terminal states
//! are retained forever for audit purposes, never hard-deleted.
//!
//! # Lifecycle
//!
//! ```text
//! Pending --> Uploaded --> Processing --> Verified | Rejected
//!                                            |          |
//!                                         (time)        |
//!                                            v          v
//!                                         Expired <-- Appealing
//! ```
//!
//! `Rejected` and `Expired` can re-enter the flow either through a new
//! document upload (back to `Uploaded`) or through an appeal (`Appealing`,
//! whose approval forces `Verified`).

mod state;

pub use state::{Identity, IdentityClaims, VerificationStatus};
