//! Credential pool module.
//!
//! Holds the upstream API keys loaded at startup and hands out a fresh
//! random ordering of them for every inbound request. The pool never
//! mutates after construction, so it is shared without locking.

mod credentials;

pub use credentials::CredentialPool;
