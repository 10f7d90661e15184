//! Key/value rendezvous store used to exchange communicator ids, trace keys
//! and the cross-rank timeout flag.

mod memory;
mod prefix;

pub use memory::MemStore;
pub use prefix::PrefixStore;

use crate::error::Result;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Minimal put/get interface shared by every rank of a job.
///
/// Each key has one designated writer; readers block in [`get`](Store::get)
/// until the key appears or the store's own timeout elapses.
pub trait Store: Send + Sync {
    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>>;

    /// Read `key`, waiting a bounded amount of time for it to be published.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Whether every key in `keys` is present, without waiting.
    fn check<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<bool>>;

    /// The store this one delegates to, if it is a namespacing wrapper.
    fn underlying(&self) -> Option<Arc<dyn Store>> {
        None
    }
}

/// Strip every namespacing wrapper from `store`.
pub fn underlying_non_prefix(store: &Arc<dyn Store>) -> Arc<dyn Store> {
    let mut current = Arc::clone(store);
    while let Some(inner) = current.underlying() {
        current = inner;
    }
    current
}
