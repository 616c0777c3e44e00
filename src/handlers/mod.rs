//! Request handlers.

pub mod object;
