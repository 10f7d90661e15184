use super::Store;
use crate::error::Result;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Namespaces every key of one process group as `{prefix}/{key}`.
pub struct PrefixStore {
    prefix: String,
    inner: Arc<dyn Store>,
}

impl PrefixStore {
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn Store>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    fn qualify(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }
}

impl Store for PrefixStore {
    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.inner.set(&self.qualify(key), value).await })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { self.inner.get(&self.qualify(key)).await })
    }

    fn check<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let qualified: Vec<String> = keys.iter().map(|k| self.qualify(k)).collect();
            self.inner.check(&qualified).await
        })
    }

    fn underlying(&self) -> Option<Arc<dyn Store>> {
        Some(Arc::clone(&self.inner))
    }
}
