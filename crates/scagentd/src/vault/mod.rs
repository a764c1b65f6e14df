//! Secret-store client and credential lifecycle.

pub mod client;
pub mod credentials;

pub use client::{AuthInfo, IssuedCert, SecretIdTtl, StoreClient};
pub use credentials::{AuthMethod, CidrResolution, CredentialLifecycle};
