//! Registry access over the [OCI distribution API](https://github.com/opencontainers/distribution-spec)
//!
//! Used to pull release and blob content from source registries,
//! push image sets to the destination, and keep metadata images there.

mod auth;
mod client;
mod name;
mod reference;

pub use auth::*;
pub use client::{Client, Tls};
pub use name::Name;
pub use reference::Reference;
