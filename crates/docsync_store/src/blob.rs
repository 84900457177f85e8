//! Blob (attachment) references.
//!
//! Blobs live outside the document body. A document refers to one with a
//! JSON object of the form
//! `{"@type": "blob", "digest": "sha256-…", "length": n, "content_type": "…"}`;
//! any such object anywhere in the body marks the document as having
//! attachments.

use crate::document::Properties;
use crate::store::StoreId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Marker value of the `@type` key for blob references.
pub const BLOB_TYPE: &str = "blob";

/// A reference to blob content stored in a document store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    digest: String,
    length: u64,
    content_type: String,
    store_id: Option<StoreId>,
}

impl Blob {
    pub(crate) fn new(content_type: &str, data: &[u8], store_id: StoreId) -> Self {
        Self {
            digest: Self::digest_of(data),
            length: data.len() as u64,
            content_type: content_type.to_string(),
            store_id: Some(store_id),
        }
    }

    /// Computes the content digest for blob data.
    pub fn digest_of(data: &[u8]) -> String {
        let hash = Sha256::digest(data);
        let hex: String = hash.iter().map(|b| format!("{b:02x}")).collect();
        format!("sha256-{hex}")
    }

    /// Parses a blob reference out of a JSON value.
    ///
    /// The result has no owning store.
    pub fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.get("@type")?.as_str()? != BLOB_TYPE {
            return None;
        }
        Some(Self {
            digest: obj.get("digest")?.as_str()?.to_string(),
            length: obj.get("length").and_then(Value::as_u64).unwrap_or(0),
            content_type: obj
                .get("content_type")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream")
                .to_string(),
            store_id: None,
        })
    }

    /// Returns the JSON reference to embed in a document body.
    pub fn to_json(&self) -> Value {
        json!({
            "@type": BLOB_TYPE,
            "digest": self.digest,
            "length": self.length,
            "content_type": self.content_type,
        })
    }

    /// Content digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Content length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// MIME type.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// The store this blob was saved to, if known.
    pub fn store_id(&self) -> Option<StoreId> {
        self.store_id
    }
}

/// Blob content shipped alongside a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobData {
    /// Content digest.
    pub digest: String,
    /// MIME type.
    pub content_type: String,
    /// Raw content.
    pub data: Vec<u8>,
}

/// Collects every blob reference in a document body.
pub fn collect_blobs(properties: &Properties) -> Vec<Blob> {
    let mut found = Vec::new();
    for value in properties.values() {
        walk(value, &mut found);
    }
    found
}

fn walk(value: &Value, found: &mut Vec<Blob>) {
    if let Some(blob) = Blob::from_json(value) {
        found.push(blob);
        return;
    }
    match value {
        Value::Object(map) => map.values().for_each(|v| walk(v, found)),
        Value::Array(items) => items.iter().for_each(|v| walk(v, found)),
        _ => {}
    }
}
