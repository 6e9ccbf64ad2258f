use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use std::path::Path;
use anyhow::{Result, Context};

/// A single fjall partition inside its own keyspace
pub struct FjallWrapper {
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl FjallWrapper {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_partition(path, "default")
    }

    pub fn with_partition<P: AsRef<Path>>(path: P, partition: &str) -> Result<Self> {
        let keyspace = Config::new(path.as_ref())
            .open()
            .with_context(|| format!("Failed to open Fjall keyspace at {}", path.as_ref().display()))?;

        let partition = keyspace
            .open_partition(partition, PartitionCreateOptions::default())
            .with_context(|| format!("Failed to open partition '{}'", partition))?;

        Ok(Self {
            keyspace,
            partition,
        })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.partition.insert(key, value)
            .context("Failed to put value in DB")?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let res = self.partition
            .get(key)
            .context("Failed to get value from DB")?;
        Ok(res.map(|slice| slice.to_vec()))
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.partition.remove(key)
            .context("Failed to delete value from DB")?;
        Ok(())
    }

    /// All key/value pairs whose key starts with `prefix`, in key order
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.partition
            .prefix(prefix)
            .map(|item| {
                let (key, value) = item.context("Failed to read entry from DB")?;
                Ok((key.to_vec(), value.to_vec()))
            })
            .collect()
    }

    // Method to perform batch operations
    pub fn batch_put(&self, items: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut batch = self.keyspace.batch();
        for (key, value) in items {
            batch.insert(&self.partition, key, value);
        }
        batch.commit()
            .context("Failed to commit batch")?;
        Ok(())
    }

    /// Flush the journal to disk
    pub fn flush(&self) -> Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("Failed to persist keyspace")?;
        Ok(())
    }
}
