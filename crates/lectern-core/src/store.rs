//! The storage contract and its shared semantics
//!
//! [`LibraryStore`] is the single interface the rest of the system
//! talks to. Three engines implement it: [`crate::sqlite::SqliteStore`],
//! [`crate::kv::SledStore`], and [`crate::kv::MemoryStore`]. The trait
//! is object safe so a `Box<dyn LibraryStore>` can be picked at runtime
//! from configuration via [`open_store`].
//!
//! The helpers at the bottom pin down semantics every engine must agree
//! on: validation, filter matching, and the canonical result orderings.
//! The KV engines call them directly; the relational engine expresses
//! the same rules in SQL. The contract tests at the end hold all three
//! engines to identical observable behavior.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::kv::{MemoryStore, SledStore};
use crate::models::{
    Annotation, Collection, Document, DocumentType, Flashcard, FlashcardReview, ReadingSession,
    SavedSearch, Task, TaskStatus,
};
use crate::sqlite::SqliteStore;

// ==================== Backend Selection ====================

/// Which storage engine to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Relational engine with full-text search; the default
    #[default]
    Sqlite,
    /// Durable key-value engine over sled
    Kv,
    /// Volatile in-memory engine
    Memory,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Sqlite => "sqlite",
            Backend::Kv => "kv",
            Backend::Memory => "memory",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Backend::Sqlite),
            "kv" => Ok(Backend::Kv),
            "memory" => Ok(Backend::Memory),
            _ => Err(StoreError::UnknownBackend(s.to_string())),
        }
    }
}

/// Open the storage engine selected by `config`
///
/// When the sqlite database cannot be opened the volatile in-memory
/// engine is substituted with a warning, so the library stays usable
/// on a broken data directory. Failures opening the sled tree are
/// reported to the caller instead.
pub fn open_store(config: &Config) -> Result<Box<dyn LibraryStore>> {
    match config.backend {
        Backend::Sqlite => match SqliteStore::open(config.sqlite_path()) {
            Ok(store) => Ok(Box::new(store)),
            Err(err) => {
                warn!("cannot open sqlite store, using volatile memory store: {}", err);
                Ok(Box::new(MemoryStore::new()))
            }
        },
        Backend::Kv => Ok(Box::new(SledStore::open(config.kv_path())?)),
        Backend::Memory => Ok(Box::new(MemoryStore::new())),
    }
}

// ==================== Filters ====================

/// Criteria for listing documents; set fields are AND-ed together
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    /// Free-text query. The relational engine matches stemmed FTS
    /// tokens; the KV engines match substrings of title, abstract,
    /// notes, and full text.
    pub search: Option<String>,
    /// Case-insensitive tag match
    pub tag: Option<String>,
    pub source: Option<String>,
    pub doc_type: Option<DocumentType>,
    /// Cap applied after ordering
    pub limit: Option<usize>,
}

/// Criteria for listing flashcards
#[derive(Debug, Clone, Default)]
pub struct FlashcardFilter {
    pub document_id: Option<Uuid>,
    /// Case-insensitive tag match
    pub tag: Option<String>,
    /// Keep cards due at or before this instant
    pub due_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Criteria for listing tasks
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub collection_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
}

// ==================== The Contract ====================

/// Persistence contract satisfied by every storage engine
///
/// Insert and update operations take `&mut` entities and stamp
/// identifiers and timestamps in place, so the caller's value always
/// mirrors what was stored. Lookups return `Ok(None)` for absent
/// records; only operations that require an existing target (updates,
/// [`end_session`](LibraryStore::end_session), reviews) report
/// [`StoreError::NotFound`]. Deletes are idempotent.
///
/// Mutation goes through `&mut self`: one writer per store instance.
/// Callers sharing a store across threads serialize writes themselves,
/// typically with a mutex around the instance.
pub trait LibraryStore {
    /// Engine name for logs and diagnostics
    fn backend_name(&self) -> &'static str;

    // ==================== Documents ====================

    /// Insert a new document, stamping its id and timestamps
    ///
    /// A nil id is replaced with a fresh one. Fails with
    /// [`StoreError::Duplicate`] when the id, the path, or the
    /// (source, source_id) pair is already taken.
    fn add_document(&mut self, doc: &mut Document) -> Result<()>;

    fn get_document(&self, id: Uuid) -> Result<Option<Document>>;

    fn get_document_by_path(&self, path: &str) -> Result<Option<Document>>;

    fn get_document_by_source_id(&self, source: &str, source_id: &str)
        -> Result<Option<Document>>;

    /// Documents matching `filter`, most recently updated first
    fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>>;

    /// Replace a stored document, keeping `created_at` and bumping
    /// `updated_at`
    fn update_document(&mut self, doc: &mut Document) -> Result<()>;

    /// Delete a document together with its annotations, sessions,
    /// flashcards (and their reviews), and collection memberships
    fn delete_document(&mut self, id: Uuid) -> Result<()>;

    // ==================== Tags ====================

    /// Add a tag unless the document already carries it (compared
    /// ascii-case-insensitively); a no-op leaves `updated_at` alone
    fn add_tag(&mut self, document_id: Uuid, tag: &str) -> Result<()> {
        let mut doc = self
            .get_document(document_id)?
            .ok_or_else(|| StoreError::not_found("document", document_id))?;
        if doc.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            return Ok(());
        }
        doc.add_tag(tag);
        self.update_document(&mut doc)
    }

    /// Remove a tag; removing an absent tag is a no-op
    fn remove_tag(&mut self, document_id: Uuid, tag: &str) -> Result<()> {
        let mut doc = self
            .get_document(document_id)?
            .ok_or_else(|| StoreError::not_found("document", document_id))?;
        if !doc.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            return Ok(());
        }
        doc.remove_tag(tag);
        self.update_document(&mut doc)
    }

    /// Tag names with document counts, grouped case-insensitively
    fn list_tags(&self) -> Result<HashMap<String, usize>>;

    // ==================== Collections ====================

    /// Create a collection; names are unique case-insensitively
    fn create_collection(&mut self, name: &str, description: &str) -> Result<Collection>;

    /// Look up by id or by name (name matching is case-insensitive)
    fn get_collection(&self, id_or_name: &str) -> Result<Option<Collection>>;

    /// All collections, in name order
    fn list_collections(&self) -> Result<Vec<Collection>>;

    /// Add a document to a collection; membership is idempotent
    fn add_to_collection(&mut self, collection_id: Uuid, document_id: Uuid) -> Result<()>;

    fn remove_from_collection(&mut self, collection_id: Uuid, document_id: Uuid) -> Result<()>;

    /// Delete a collection without touching its member documents
    fn delete_collection(&mut self, id: Uuid) -> Result<()>;

    // ==================== Annotations ====================

    fn add_annotation(&mut self, annotation: &mut Annotation) -> Result<()>;

    /// Annotations for a document, in page order with unpaged ones last
    fn get_annotations(&self, document_id: Uuid) -> Result<Vec<Annotation>>;

    fn delete_annotation(&mut self, id: Uuid) -> Result<()>;

    // ==================== Reading Sessions ====================

    /// Open a session starting now
    fn start_session(&mut self, document_id: Uuid) -> Result<ReadingSession>;

    /// Close a session, recording pages read and notes
    fn end_session(&mut self, session_id: Uuid, pages_read: u32, notes: &str) -> Result<()>;

    /// Sessions for a document, most recent first
    fn list_sessions(&self, document_id: Uuid) -> Result<Vec<ReadingSession>>;

    // ==================== Flashcards ====================

    fn add_flashcard(&mut self, card: &mut Flashcard) -> Result<()>;

    fn get_flashcard(&self, id: Uuid) -> Result<Option<Flashcard>>;

    /// Cards matching `filter`, soonest due first
    fn list_flashcards(&self, filter: &FlashcardFilter) -> Result<Vec<Flashcard>>;

    fn update_flashcard(&mut self, card: &mut Flashcard) -> Result<()>;

    /// Delete a card along with its review history
    fn delete_flashcard(&mut self, id: Uuid) -> Result<()>;

    /// Grade a card 0-5 and reschedule it
    ///
    /// Returns the card with its new interval, ease, and due date. A
    /// review record capturing the pre-review state is appended to the
    /// card's history.
    fn review_flashcard(&mut self, id: Uuid, quality: u8) -> Result<Flashcard>;

    /// Review history for a card, most recent first
    fn list_reviews(&self, flashcard_id: Uuid) -> Result<Vec<FlashcardReview>>;

    /// Cards due at or before `due_before`, soonest first
    fn list_due_flashcards(
        &self,
        due_before: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Flashcard>> {
        self.list_flashcards(&FlashcardFilter {
            due_before: Some(due_before),
            limit,
            ..Default::default()
        })
    }

    // ==================== Tasks ====================
    // Relational-only; the KV engines return `Unsupported`.

    fn add_task(&mut self, task: &mut Task) -> Result<()>;

    fn get_task(&self, id: Uuid) -> Result<Option<Task>>;

    /// Tasks matching `filter`, most recently created first
    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    fn update_task(&mut self, task: &mut Task) -> Result<()>;

    fn delete_task(&mut self, id: Uuid) -> Result<()>;

    // ==================== Saved Searches ====================
    // Relational-only; the KV engines return `Unsupported`.

    /// Insert, or replace the search with the same name; on replace the
    /// stored id and `created_at` win and are copied back
    fn save_search(&mut self, search: &mut SavedSearch) -> Result<()>;

    fn get_saved_search(&self, id_or_name: &str) -> Result<Option<SavedSearch>>;

    /// All saved searches, most recently updated first
    fn list_saved_searches(&self) -> Result<Vec<SavedSearch>>;

    fn delete_saved_search(&mut self, id: Uuid) -> Result<()>;
}

// ==================== Shared Semantics ====================
// One definition per rule; the KV engines call these directly and the
// relational engine mirrors them in SQL.

/// Field validation common to add and update
pub(crate) fn validate_document(doc: &Document) -> Result<()> {
    if let Some(rating) = doc.rating {
        if !(1..=5).contains(&rating) {
            return Err(StoreError::RatingOutOfRange(rating));
        }
    }
    Ok(())
}

pub(crate) fn matches_document(doc: &Document, filter: &DocumentFilter) -> bool {
    if let Some(tag) = &filter.tag {
        if !doc.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            return false;
        }
    }
    if let Some(source) = &filter.source {
        if doc.source.as_deref() != Some(source.as_str()) {
            return false;
        }
    }
    if let Some(doc_type) = filter.doc_type {
        if doc.doc_type != doc_type {
            return false;
        }
    }
    if let Some(search) = &filter.search {
        let needle = search.to_lowercase();
        let fields = [
            doc.title.as_str(),
            doc.abstract_text.as_str(),
            doc.notes.as_str(),
            doc.full_text.as_str(),
        ];
        if !fields.iter().any(|f| f.to_lowercase().contains(&needle)) {
            return false;
        }
    }
    true
}

pub(crate) fn matches_flashcard(card: &Flashcard, filter: &FlashcardFilter) -> bool {
    if let Some(document_id) = filter.document_id {
        if card.document_id != Some(document_id) {
            return false;
        }
    }
    if let Some(tag) = &filter.tag {
        if !card.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            return false;
        }
    }
    if let Some(due_before) = filter.due_before {
        if card.due_at > due_before {
            return false;
        }
    }
    true
}

/// Most recently updated first; id breaks ties
pub(crate) fn sort_documents(docs: &mut [Document]) {
    docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
}

/// Name order, ascii-case-insensitive; unique names leave no ties
pub(crate) fn sort_collections(collections: &mut [Collection]) {
    collections.sort_by(|a, b| {
        a.name
            .to_ascii_lowercase()
            .cmp(&b.name.to_ascii_lowercase())
            .then(a.id.cmp(&b.id))
    });
}

/// Page order with unpaged annotations last, then creation order
pub(crate) fn sort_annotations(annotations: &mut [Annotation]) {
    annotations.sort_by(|a, b| {
        a.page
            .is_none()
            .cmp(&b.page.is_none())
            .then(a.page.cmp(&b.page))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

/// Most recently started first
pub(crate) fn sort_sessions(sessions: &mut [ReadingSession]) {
    sessions.sort_by(|a, b| b.start_at.cmp(&a.start_at).then(a.id.cmp(&b.id)));
}

/// Soonest due first
pub(crate) fn sort_flashcards(cards: &mut [Flashcard]) {
    cards.sort_by(|a, b| a.due_at.cmp(&b.due_at).then(a.id.cmp(&b.id)));
}

/// Most recently reviewed first
pub(crate) fn sort_reviews(reviews: &mut [FlashcardReview]) {
    reviews.sort_by(|a, b| b.reviewed_at.cmp(&a.reviewed_at).then(a.id.cmp(&b.id)));
}

/// Fold tag lists into name -> usage count
///
/// Grouping is ascii-case-insensitive and the spelling seen first is
/// the one reported. Callers pass lists in document listing order
/// (most recently updated first, id as tiebreak) so the reported
/// spelling is the same on every backend.
pub(crate) fn fold_tag_counts<'a, I>(lists: I) -> HashMap<String, usize>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut canonical: HashMap<String, String> = HashMap::new();
    for list in lists {
        for tag in list {
            let key = tag.to_ascii_lowercase();
            let name = canonical.entry(key).or_insert_with(|| tag.clone());
            *counts.entry(name.clone()).or_insert(0) += 1;
        }
    }
    counts
}
