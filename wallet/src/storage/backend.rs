// Key-value storage provider backends. The sled backend is the primary
// on-disk store; the in-memory backend serves tests and ephemeral
// wallets.

use crate::providers::StorageProvider;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::trace;
use std::{collections::HashMap, sync::Mutex};

pub struct MemoryStorageProvider {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorageProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }
}

pub struct SledStorageProvider {
    db: sled::Db,
}

impl SledStorageProvider {
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path).context("Error while opening wallet storage")?;
        Ok(Self { db })
    }
}

#[async_trait]
impl StorageProvider for SledStorageProvider {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        trace!("storage get {}", key);
        let value = self.db.get(key.as_bytes())?;
        value
            .map(|bytes| {
                String::from_utf8(bytes.to_vec()).context("Invalid utf-8 in storage value")
            })
            .transpose()
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        trace!("storage set {}", key);
        self.db.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        trace!("storage remove {}", key);
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
