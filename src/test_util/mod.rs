//! Utilities for testing code that builds on the chat node. They are part of the crate's regular
//!  code so that applications can use them in their own tests.

pub mod peer;
pub mod packet_sender;
