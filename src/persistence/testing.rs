//! Fault-injecting store backend for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::sled_store::{BatchOp, KvStore, SledKv, Store, WriteBatch};
use crate::utils::{Error, Result};

/// Wraps a temporary sled database and fails selected writes.
pub struct FaultyKv {
    inner: SledKv,
    fail_all: AtomicBool,
    needle: Mutex<Option<Vec<u8>>>,
}

impl FaultyKv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SledKv::temporary().unwrap(),
            fail_all: AtomicBool::new(false),
            needle: Mutex::new(None),
        })
    }

    /// Fail every write from now on.
    pub fn fail_writes(&self, on: bool) {
        self.fail_all.store(on, Ordering::SeqCst);
    }

    /// Fail any batch that stores a value containing `needle`.
    pub fn fail_values_containing(&self, needle: &[u8]) {
        *self.needle.lock().unwrap() = Some(needle.to_vec());
    }

    /// Stop failing anything.
    pub fn heal(&self) {
        self.fail_writes(false);
        *self.needle.lock().unwrap() = None;
    }

    pub fn store(self: &Arc<Self>) -> Store {
        Store::with_backend(self.clone())
    }

    fn should_fail(&self, value: &[u8]) -> bool {
        if self.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        match self.needle.lock().unwrap().as_deref() {
            Some(needle) => value.windows(needle.len()).any(|w| w == needle),
            None => false,
        }
    }
}

impl KvStore for FaultyKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.should_fail(value) {
            return Err(Error::Injected("put".into()));
        }
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(Error::Injected("delete".into()));
        }
        self.inner.delete(key)
    }

    fn batch_write(&self, batch: WriteBatch) -> Result<()> {
        let poisoned = batch.ops().iter().any(|op| match op {
            BatchOp::Put(_, v) => self.should_fail(v),
            BatchOp::Delete(_) => self.fail_all.load(Ordering::SeqCst),
        });
        if poisoned {
            return Err(Error::Injected("batch".into()));
        }
        self.inner.batch_write(batch)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }
}
