//! Persistence layer backed by `sled`
//!
//! `sled` gives us an ordered, crash-safe key/value tree with atomic batches,
//! which is all the durable queue index needs: every append or delete of a
//! message is applied together with the updated range index in one batch, so
//! the index can never reference a missing message (or the other way round).

use std::path::Path;
use std::sync::Arc;

use prost::Message as _;
use tracing::debug;

use crate::persistence::records::{DeclarationType, QueueConfiguration, QueueDeclaration, QueueIndex};
use crate::transport::message::WireMessage;
use crate::utils::{Error, Result};

/// Key holding the list of declared queues.
pub const CONFIG_KEY: &str = "!config";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A set of writes applied atomically by [`KvStore::batch_write`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.as_ref().to_vec(), value.into()));
    }

    pub fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.ops.push(BatchOp::Delete(key.as_ref().to_vec()));
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Ordered key/value engine used by [`Store`].
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    /// Apply every operation in `batch`, or none of them.
    fn batch_write(&self, batch: WriteBatch) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct SledKv {
    db: sled::Db,
}

impl SledKv {
    /// Open or create a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// A database that lives only as long as this handle.
    pub fn temporary() -> Result<Self> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }
}

impl KvStore for SledKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    fn batch_write(&self, batch: WriteBatch) -> Result<()> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => sled_batch.insert(k, v),
                BatchOp::Delete(k) => sled_batch.remove(k),
            }
        }
        self.db.apply_batch(sled_batch)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SledKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledKv").field("db", &"sled::Db").finish()
    }
}

/// The broker's view of the key/value store.
#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn KvStore>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_backend(Arc::new(SledKv::open(path)?)))
    }

    pub fn temporary() -> Result<Self> {
        Ok(Self::with_backend(Arc::new(SledKv::temporary()?)))
    }

    pub fn with_backend(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn queue_key(name: &str) -> String {
        format!("-{name}")
    }

    pub fn message_key(name: &str, index: u64) -> String {
        format!("-{name}:{index}")
    }

    /// Read the range index of `name`. `Ok(None)` when the queue was never
    /// reserved.
    pub fn read_queue(&self, name: &str) -> Result<Option<QueueIndex>> {
        let key = Self::queue_key(name);
        match self.kv.get(key.as_bytes())? {
            None => Ok(None),
            Some(raw) => QueueIndex::decode(raw.as_slice())
                .map(Some)
                .map_err(|e| Error::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
        }
    }

    pub fn read_message(&self, key: &str) -> Result<Option<WireMessage>> {
        match self.kv.get(key.as_bytes())? {
            None => Ok(None),
            Some(raw) => WireMessage::decode(raw.as_slice())
                .map(Some)
                .map_err(|e| Error::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Store `body` under `key` and the updated `index` of `name` in one batch.
    pub fn append_message(&self, name: &str, index: &QueueIndex, key: &str, body: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(key, body.to_vec());
        batch.put(Self::queue_key(name), index.encode_to_vec());
        self.kv.batch_write(batch)
    }

    /// Delete `key` and store the updated `index` of `name` in one batch.
    pub fn remove_message(&self, name: &str, index: &QueueIndex, key: &str) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.delete(key);
        batch.put(Self::queue_key(name), index.encode_to_vec());
        self.kv.batch_write(batch)
    }

    /// Make sure an index record exists for `name`. Returns true when one had
    /// to be created.
    pub fn reserve(&self, name: &str) -> Result<bool> {
        let key = Self::queue_key(name);
        if self.kv.get(key.as_bytes())?.is_some() {
            debug!("Already reserved {name}");
            return Ok(false);
        }
        self.kv.put(key.as_bytes(), &QueueIndex::default().encode_to_vec())?;
        debug!("Reserved {name}");
        Ok(true)
    }

    pub fn read_declarations(&self) -> Result<Vec<QueueDeclaration>> {
        match self.kv.get(CONFIG_KEY.as_bytes())? {
            None => Ok(Vec::new()),
            Some(raw) => QueueConfiguration::decode(raw.as_slice())
                .map(|cfg| cfg.queues)
                .map_err(|e| Error::Corrupt {
                    key: CONFIG_KEY.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Insert or update the declaration of `name`.
    pub fn add_declaration(&self, name: &str, kind: DeclarationType) -> Result<()> {
        let mut cfg = QueueConfiguration {
            queues: self.read_declarations()?,
        };

        match cfg.queues.iter_mut().find(|d| d.name == name) {
            Some(decl) => decl.r#type = kind as i32,
            None => cfg.queues.push(QueueDeclaration {
                name: name.to_string(),
                r#type: kind as i32,
            }),
        }

        self.kv.put(CONFIG_KEY.as_bytes(), &cfg.encode_to_vec())
    }

    pub fn flush(&self) -> Result<()> {
        self.kv.flush()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("kv", &"dyn KvStore").finish()
    }
}
