//! Startup-time registry of physical backend constructors.

use std::collections::HashMap;
use std::sync::Arc;

use crate::Backend;
use crate::BackendError;
use crate::InmemBackend;

/// Constructor for a physical backend, fed the raw configuration map.
pub type BackendFactory =
    fn(&HashMap<String, String>) -> Result<Arc<dyn Backend>, BackendError>;

/// Maps a configured backend name to its constructor.
///
/// The raft backend registers itself here at node startup; `inmem` is always
/// available for tests and tooling.
#[derive(Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register("inmem", |_conf| Ok(Arc::new(InmemBackend::new()) as Arc<dyn Backend>));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn construct(
        &self,
        name: &str,
        conf: &HashMap<String, String>,
    ) -> Result<Arc<dyn Backend>, BackendError> {
        let factory = self.factories.get(name).ok_or_else(|| BackendError::InvalidConfiguration {
            message: format!("unknown physical backend type {name:?}"),
        })?;
        factory(conf)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Entry;

    #[tokio::test]
    async fn registry_constructs_inmem() {
        let registry = BackendRegistry::new();
        let backend = registry.construct("inmem", &HashMap::new()).unwrap();
        backend.put(Entry::new("k", b"v".to_vec())).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap().unwrap().value, b"v");
    }

    #[test]
    fn registry_rejects_unknown_backend() {
        let registry = BackendRegistry::new();
        let err = registry.construct("consul", &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("unknown physical backend"));
    }
}
