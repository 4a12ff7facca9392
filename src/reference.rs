//! Reference implementations of bosun's boundary traits.
//!
//! The engine itself never depends on anything in this module; it exists so
//! the crate is usable end to end without writing a transport first.

pub mod ssh;

#[doc(inline)]
pub use ssh::SshCommunicator;
