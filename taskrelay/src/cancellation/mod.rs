//! Cooperative cancellation for pipeline runs and trigger loops.

mod token;

pub use token::CancellationToken;
