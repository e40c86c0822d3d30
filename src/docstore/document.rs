//! Documents and document type lookup

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// A stored document: an id, a type name and a set of fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id; empty when only the fields were materialized
    #[serde(default)]
    pub id: String,
    pub doc_type: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            doc_type: doc_type.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::Storage(format!("Failed to serialize document: {}", e)))
    }
}

/// Registry of known document types used when decoding stored documents
#[derive(Debug, Clone, Default)]
pub struct DocumentTypeRepo {
    types: HashSet<String>,
}

impl DocumentTypeRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, name: impl Into<String>) -> Self {
        self.register(name);
        self
    }

    pub fn register(&mut self, name: impl Into<String>) {
        self.types.insert(name.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains(name)
    }

    /// Decode a serialized document, rejecting unknown types
    pub fn decode(&self, bytes: &[u8]) -> Result<Document> {
        let doc: Document = serde_json::from_slice(bytes)
            .map_err(|e| Error::Decode(format!("Malformed document: {}", e)))?;
        if !self.contains(&doc.doc_type) {
            return Err(Error::Decode(format!(
                "Unknown document type: {}",
                doc.doc_type
            )));
        }
        Ok(doc)
    }
}
