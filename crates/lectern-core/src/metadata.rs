//! Collaborator seams for metadata lookup and text extraction
//!
//! The core only persists what these collaborators produce; network
//! fetching and file parsing live behind the traits. A resolver turns
//! an external identifier (a DOI, an arXiv id) into bibliographic
//! fields; an extractor pulls plain text out of a file for search.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Document;

/// Bibliographic fields resolved for an external identifier
///
/// Every field is optional; resolvers fill in what they know.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub abstract_text: Option<String>,
    pub year: Option<i32>,
    pub journal: Option<String>,
    pub url: Option<String>,
}

/// Resolves an external identifier to document metadata
pub trait MetadataResolver {
    fn resolve(&self, id: &str) -> Result<DocumentMetadata>;
}

/// Extracts plain text from a file on disk
pub trait TextExtractor {
    fn extract(&self, path: &Path) -> Result<String>;
}

impl Document {
    /// Merge resolved metadata into this document
    ///
    /// Resolved title, authors, and abstract replace the stored
    /// values; fields the resolver left empty never clobber what is
    /// already there. Year, journal, and url go into the metadata
    /// map. `updated_at` is bumped once if anything changed.
    pub fn apply_metadata(&mut self, meta: &DocumentMetadata) {
        let mut changed = false;

        if let Some(title) = meta.title.as_deref() {
            if !title.is_empty() && self.title != title {
                self.title = title.to_string();
                changed = true;
            }
        }
        if !meta.authors.is_empty() && self.authors != meta.authors {
            self.authors = meta.authors.clone();
            changed = true;
        }
        if let Some(abstract_text) = meta.abstract_text.as_deref() {
            if !abstract_text.is_empty() && self.abstract_text != abstract_text {
                self.abstract_text = abstract_text.to_string();
                changed = true;
            }
        }

        changed |= self.merge_meta_field("year", meta.year.map(Value::from));
        changed |= self.merge_meta_field(
            "journal",
            meta.journal.as_deref().filter(|j| !j.is_empty()).map(Value::from),
        );
        changed |= self.merge_meta_field(
            "url",
            meta.url.as_deref().filter(|u| !u.is_empty()).map(Value::from),
        );

        if changed {
            self.touch();
        }
    }

    fn merge_meta_field(&mut self, key: &str, value: Option<Value>) -> bool {
        let Some(value) = value else {
            return false;
        };
        if self.meta.get(key) == Some(&value) {
            return false;
        }
        self.meta.insert(key.to_string(), value);
        true
    }
}
