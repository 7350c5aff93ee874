//! In-memory backend. Same contract as RocksDB, no durability.

use std::collections::{BTreeMap, HashSet};

use parking_lot::RwLock;

use super::{Result, StorageBackend};
use crate::document::Document;

#[derive(Default)]
pub struct MemoryBackend {
    documents: RwLock<BTreeMap<String, Document>>,
    visitors: RwLock<HashSet<(String, String)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self, path: &str) -> Result<Option<Document>> {
        Ok(self.documents.read().get(path).cloned())
    }

    fn save(&self, doc: &Document) -> Result<()> {
        self.documents.write().insert(doc.path.clone(), doc.clone());
        Ok(())
    }

    fn save_with_visitor(&self, doc: &Document, visitor_key: &str) -> Result<()> {
        let mut documents = self.documents.write();
        let mut visitors = self.visitors.write();
        visitors.insert((doc.path.clone(), visitor_key.to_string()));
        documents.insert(doc.path.clone(), doc.clone());
        Ok(())
    }

    fn has_visitor(&self, path: &str, visitor_key: &str) -> Result<bool> {
        Ok(self
            .visitors
            .read()
            .contains(&(path.to_string(), visitor_key.to_string())))
    }

    fn scan(&self, prefix: &str) -> Result<Vec<Document>> {
        Ok(self
            .documents
            .read()
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(_, doc)| doc.clone())
            .collect())
    }
}
