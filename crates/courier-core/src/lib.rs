//! Core abstractions for courier session management.
//!
//! This crate provides the building blocks the session manager is wired from:
//! - `Identity` - Opaque handle naming a provisioned user
//! - `credential` - Decode-only view of bearer credentials
//! - `Clock` and `SessionConfig` - Time source and tunables
//! - Traits for the credential issuer, encrypted store and protocol client

pub mod clock;
pub mod config;
pub mod credential;
pub mod identity;
pub mod traits;

pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, SessionConfig};
pub use credential::{DecodeError, DecodedCredential, decode_unverified, generate_device_id};
pub use identity::Identity;
pub use traits::{
    ClientError, ClientFactory, CredentialIssuer, EngineStorage, IssueError, IssuedCredential,
    ProtocolClient, SessionStore, StoreError, StoreHandle,
};
