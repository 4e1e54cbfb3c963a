//! # Stratum Value
//!
//! The serialization layer: live resource values, secrets, and the codec
//! that turns them into a canonical JSON tree (and back).
//!
//! - [`Value`] - Live values with `Arc` identity for shared sub-trees
//! - [`Secret`] - Sensitive strings, encrypted at rest when a passphrase is set
//! - [`Codec`] - Deterministic serializer with an alias table
//! - [`dependencies`] - Resource references embedded in a canonical tree

pub mod codec;
pub mod deps;
pub mod secret;
pub mod value;

pub use codec::Codec;
pub use deps::dependencies;
pub use secret::{Secret, SecretCipher};
pub use value::{Opaque, ResourceRef, Value};
