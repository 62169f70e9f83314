use std::collections::BTreeMap;

use super::{AuthError, ConfigStore};

/// In-memory `ConfigStore` counting flushes.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryStore {
    hosts: BTreeMap<String, BTreeMap<String, String>>,
    pub(crate) writes: usize,
}

impl MemoryStore {
    pub(crate) fn value(&self, host: &str, key: &str) -> Option<&str> {
        self.hosts
            .get(host)
            .and_then(|settings| settings.get(key))
            .map(String::as_str)
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.hosts.clone()
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, host: &str, key: &str) -> Result<Option<String>, AuthError> {
        Ok(self.value(host, key).map(ToOwned::to_owned))
    }

    fn set(&mut self, host: &str, key: &str, value: &str) -> Result<(), AuthError> {
        self.hosts
            .entry(host.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&mut self, host: &str, key: &str) -> Result<(), AuthError> {
        if let Some(settings) = self.hosts.get_mut(host) {
            settings.remove(key);
        }
        Ok(())
    }

    fn write(&mut self) -> Result<(), AuthError> {
        self.writes += 1;
        Ok(())
    }
}
