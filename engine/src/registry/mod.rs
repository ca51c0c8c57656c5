//! Docker Distribution v2 registry client.
//!
//! Split into the challenge/token layer (`auth`), the backoff helper
//! (`retry`), and the HTTP session itself (`client`).

pub mod auth;
pub mod client;
pub mod retry;

pub use auth::AuthChallenge;
pub use client::{MountOutcome, RegistryClient, RegistrySecurity};
pub use retry::{retry, RetryPolicy};
