//! Buffer Utilities
//!
//! A link layer cannot allocate while servicing the radio, so every queue and payload it holds is
//! a fixed capacity buffer allocated along with the connection.

pub mod stack;
