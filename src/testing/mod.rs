//! Testing utilities and mock implementations
//!
//! A scriptable [`Transport`](crate::transport::Transport) so the publish
//! loop can be exercised without a broker.

pub mod mocks;

pub use mocks::*;
