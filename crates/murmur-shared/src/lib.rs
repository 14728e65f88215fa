//! # murmur-shared
//!
//! Types shared between the store and the server: typed ids, the message
//! status lattice, domain records and the wire protocol spoken over
//! persistent client connections.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod types;
