//! Shared primitives for the replication engine.
//!
//! ## IDs
//! - `ClientId`: replica identifier
//! - `Id`: one clock tick of one client, `(client, clock)`
//!
//! ## Clocks
//! - `StateVector`: per-client next expected clock

pub mod clock;
pub mod id;

// Re-exports for convenience
pub use clock::StateVector;
pub use id::ClientId;
pub use id::Id;
pub use id::random_client_id;
