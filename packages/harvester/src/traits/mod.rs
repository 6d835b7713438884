//! Seams between the engine and its collaborators.
//!
//! The upstream API sits behind [`source::PageSource`] and the completion
//! ledger behind [`ledger::CompletionLedger`], so both can be replaced in tests.

pub mod ledger;
pub mod source;
