//! Kestrel Integration Tests
//!
//! Supervisor tests spawn real processes and run against the in-memory
//! backend. Run with: `cargo test -p kestrel-tests`
//!
//! For tests that require Redis and the qless-core script:
//! ```sh
//! docker run -d -p 6379:6379 redis:7-alpine
//! KESTREL_QLESS_SCRIPT=path/to/qless.lua cargo test -p kestrel-tests -- --ignored
//! ```

pub mod common;
