//! Query-side text processing: sanitization, vocabulary, routing and
//! short-query expansion.

pub mod expansion;
pub mod router;
pub mod sanitize;
pub mod vocabulary;

pub use expansion::ShortQueryExpander;
pub use router::{QueryRouter, RouteOutcome};
