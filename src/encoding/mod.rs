//! Serialization of log entries, pointers and descriptors.
//!
//! Ordering-sensitive bytes (composite keys, index keyspaces) are laid out by
//! hand with `byteorder`; everything stored as an opaque value goes through
//! the bincode helpers here.

pub mod bincode;
