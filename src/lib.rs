//! Client coordination core of an online exam-proctoring system.
//!
//! Proctors monitor examinees over a managed conferencing session that
//! only offers an unordered, best-effort broadcast data channel and
//! independent presence/tile/volume event streams. This crate implements
//! the pieces that make that substrate usable: the participant identity
//! encoding, the chat and exam-control message protocol, the proctor-side
//! participant reconciliation, and the session lifecycle controllers for
//! both roles. Rendering, the identity provider, and the conferencing
//! engine itself live elsewhere and are consumed through traits.

pub mod backend;
pub mod capability;
pub mod config;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod session;

pub use error::{ExamError, Result};
