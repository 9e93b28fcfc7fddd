//! Generic persistence layer.
//!
//! A [`Persistence`] works against any [`NativeDriver`](crate::driver::NativeDriver):
//!
//! ```text
//! Persistence<D, T> ──► Connection<D> ──► D::Handle
//!        │                    ▲
//!        └── References ──────┘ (shared connection)
//! ```
//!
//! Backend differences (id field, collection tag, partial update and batch
//! delete strategy) come from the [`BackendProfile`](crate::connect::BackendProfile).

// Allow significant_drop_tightening - lock guards are held for one statement.
#![allow(clippy::significant_drop_tightening)]

mod connection;
mod identifiable;
pub mod mapping;
mod metrics;
mod paging;
mod persistence;
mod references;

pub use connection::Connection;
pub use identifiable::{EntityKey, Identifiable, IdentifiablePersistence, generate_id};
pub use metrics::{record_operation_metrics, timed};
pub use paging::{DEFAULT_MAX_PAGE_SIZE, DataPage, PagingParams};
pub use persistence::{FilterOf, Persistence, SortOf};
pub use references::{CONNECTION, References};
