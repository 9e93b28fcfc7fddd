//! Connection resolution.
//!
//! Turns configuration into a validated [`ComposedConnection`]:
//!
//! ```text
//! ConfigParams ─► ConnectionResolver ─┐
//!                                     ├─► ConnectionComposer ─► ComposedConnection
//! ConfigParams ─► CredentialResolver ─┘        (BackendProfile)
//! ```
//!
//! Validation and composition are pure; nothing here performs I/O.

mod composer;
mod descriptor;
mod profile;
mod resolver;

pub use composer::{ComposedConnection, ConnectionComposer};
pub use descriptor::{ConnectionDescriptor, CredentialDescriptor};
pub use profile::{AuthPlacement, BackendKind, BackendProfile, BatchDeleteMode, PartialUpdateMode};
pub use resolver::{ConnectionResolver, CredentialResolver};
