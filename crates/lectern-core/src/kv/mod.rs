//! Key-value storage engine
//!
//! Stores every entity as a JSON blob under `lectern:<kind>:<id>` and
//! maintains the indexes SQL would otherwise provide (see [`index`]).
//! The engine is generic over [`backend::KeyValue`], so the durable
//! sled store and the volatile in-memory store share one
//! implementation.
//!
//! Write policy: the entity blob is the source of truth. Primary blob
//! writes propagate errors; index maintenance after a successful blob
//! write is best-effort and only logged, so an index failure can never
//! lose the entity itself. Stale index entries are skipped on read.
//!
//! Tasks and saved searches are relational-only and return
//! [`StoreError::Unsupported`] here.

pub mod backend;
mod index;

use std::collections::HashMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::models::{
    now_ms, Annotation, Collection, Document, Flashcard, FlashcardReview, ReadingSession,
    SavedSearch, Task,
};
use crate::scheduler::{next_schedule, Quality, INITIAL_EASE};
use crate::store::{
    fold_tag_counts, matches_document, matches_flashcard, sort_annotations, sort_collections,
    sort_documents, sort_flashcards, sort_reviews, sort_sessions, validate_document,
    DocumentFilter, FlashcardFilter, LibraryStore, TaskFilter,
};

use self::backend::{KeyValue, MemoryKv, SledKv};

const DOCUMENT: &str = "document";
const COLLECTION: &str = "collection";
const ANNOTATION: &str = "annotation";
const SESSION: &str = "session";
const FLASHCARD: &str = "flashcard";
const REVIEW: &str = "review";

/// Log and swallow an index maintenance failure
fn best_effort(context: &str, outcome: Result<()>) {
    if let Err(err) = outcome {
        warn!("index update failed ({}): {}", context, err);
    }
}

fn source_pair(doc: &Document) -> Option<(&str, &str)> {
    match (&doc.source, &doc.source_id) {
        (Some(source), Some(source_id)) => Some((source.as_str(), source_id.as_str())),
        _ => None,
    }
}

/// Library store over a byte-level key-value backend
pub struct KvStore<K: KeyValue> {
    kv: K,
}

/// Durable KV store backed by sled
pub type SledStore = KvStore<SledKv>;

/// Volatile KV store over a plain map
pub type MemoryStore = KvStore<MemoryKv>;

impl<K: KeyValue> KvStore<K> {
    /// Build a store over an already-opened backend
    pub fn with_backend(kv: K) -> Self {
        Self { kv }
    }

    fn unsupported(&self, entity: &'static str) -> StoreError {
        StoreError::Unsupported {
            entity,
            backend: K::BACKEND,
        }
    }

    fn load<T: DeserializeOwned>(&self, kind: &str, id: Uuid) -> Result<Option<T>> {
        let Some(bytes) = self.kv.get(&index::entity_key(kind, id))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Load a batch of entities, skipping stale or undecodable entries
    fn load_many<T: DeserializeOwned>(&self, kind: &str, ids: &[Uuid]) -> Result<Vec<T>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.load(kind, id) {
                Ok(Some(entity)) => out.push(entity),
                Ok(None) => {}
                Err(StoreError::Json(err)) => {
                    warn!("skipping undecodable {} {}: {}", kind, id, err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    fn save<T: Serialize>(&mut self, kind: &str, id: Uuid, entity: &T) -> Result<()> {
        let bytes = serde_json::to_vec(entity)?;
        self.kv.put(&index::entity_key(kind, id), &bytes)
    }

    fn remove_entity(&mut self, kind: &str, id: Uuid) -> Result<()> {
        self.kv.remove(&index::entity_key(kind, id))
    }

    /// Resolve a unique path index entry to the document still claiming it
    ///
    /// Entries left behind by failed index maintenance (owner deleted,
    /// or owner moved to another path) resolve to `None` and are
    /// overwritten by the next write.
    fn path_owner(&self, path: &str) -> Result<Option<Document>> {
        match index::read_unique(&self.kv, &index::path_key(path))? {
            Some(id) => Ok(self
                .load::<Document>(DOCUMENT, id)?
                .filter(|doc| doc.path.as_deref() == Some(path))),
            None => Ok(None),
        }
    }

    /// Same resolution for a (source, source_id) pair
    fn source_owner(&self, source: &str, source_id: &str) -> Result<Option<Document>> {
        match index::read_unique(&self.kv, &index::source_key(source, source_id))? {
            Some(id) => Ok(self
                .load::<Document>(DOCUMENT, id)?
                .filter(|doc| source_pair(doc) == Some((source, source_id)))),
            None => Ok(None),
        }
    }
}

impl SledStore {
    /// Open (or create) a sled-backed store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let kv = SledKv::open(path)?;
        debug!("opened sled store at {:?}", path);
        Ok(Self::with_backend(kv))
    }
}

impl MemoryStore {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::with_backend(MemoryKv::new())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: KeyValue> LibraryStore for KvStore<K> {
    fn backend_name(&self) -> &'static str {
        K::BACKEND
    }

    // ==================== Document Operations ====================

    fn add_document(&mut self, doc: &mut Document) -> Result<()> {
        validate_document(doc)?;
        if doc.id.is_nil() {
            doc.id = Uuid::new_v4();
        } else if self.load::<Document>(DOCUMENT, doc.id)?.is_some() {
            return Err(StoreError::duplicate("id", doc.id));
        }
        if let Some(path) = &doc.path {
            if let Some(owner) = self.path_owner(path)? {
                if owner.id != doc.id {
                    return Err(StoreError::duplicate("path", path));
                }
            }
        }
        if let Some((source, source_id)) = source_pair(doc) {
            if let Some(owner) = self.source_owner(source, source_id)? {
                if owner.id != doc.id {
                    return Err(StoreError::duplicate(
                        "source",
                        format!("{source}:{source_id}"),
                    ));
                }
            }
        }

        let now = now_ms();
        doc.created_at = now;
        doc.updated_at = now;
        self.save(DOCUMENT, doc.id, doc)?;

        best_effort(
            "document roster",
            index::append_id(&mut self.kv, &index::roster_key(DOCUMENT), doc.id),
        );
        if let Some(path) = &doc.path {
            best_effort(
                "path index",
                index::put_unique(&mut self.kv, &index::path_key(path), doc.id),
            );
        }
        if let Some((source, source_id)) = source_pair(doc) {
            best_effort(
                "source index",
                index::put_unique(&mut self.kv, &index::source_key(source, source_id), doc.id),
            );
        }
        Ok(())
    }

    fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        self.load(DOCUMENT, id)
    }

    fn get_document_by_path(&self, path: &str) -> Result<Option<Document>> {
        self.path_owner(path)
    }

    fn get_document_by_source_id(&self, source: &str, source_id: &str) -> Result<Option<Document>> {
        self.source_owner(source, source_id)
    }

    fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>> {
        let ids = index::read_ids(&self.kv, &index::roster_key(DOCUMENT))?;
        let mut docs: Vec<Document> = self
            .load_many::<Document>(DOCUMENT, &ids)?
            .into_iter()
            .filter(|doc| matches_document(doc, filter))
            .collect();
        sort_documents(&mut docs);
        if let Some(limit) = filter.limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    fn update_document(&mut self, doc: &mut Document) -> Result<()> {
        validate_document(doc)?;
        let existing = self
            .load::<Document>(DOCUMENT, doc.id)?
            .ok_or_else(|| StoreError::not_found("document", doc.id))?;

        if let Some(path) = &doc.path {
            if let Some(owner) = self.path_owner(path)? {
                if owner.id != doc.id {
                    return Err(StoreError::duplicate("path", path));
                }
            }
        }
        if let Some((source, source_id)) = source_pair(doc) {
            if let Some(owner) = self.source_owner(source, source_id)? {
                if owner.id != doc.id {
                    return Err(StoreError::duplicate(
                        "source",
                        format!("{source}:{source_id}"),
                    ));
                }
            }
        }

        doc.created_at = existing.created_at;
        doc.touch();
        self.save(DOCUMENT, doc.id, doc)?;

        // Old unique keys are removed when they moved; the current
        // claim is re-asserted on every update, which also repairs a
        // stale entry under the same key
        if existing.path != doc.path {
            if let Some(old) = &existing.path {
                best_effort("path index", self.kv.remove(&index::path_key(old)));
            }
        }
        if let Some(new) = &doc.path {
            best_effort(
                "path index",
                index::put_unique(&mut self.kv, &index::path_key(new), doc.id),
            );
        }
        if source_pair(&existing) != source_pair(doc) {
            if let Some((source, source_id)) = source_pair(&existing) {
                best_effort(
                    "source index",
                    self.kv.remove(&index::source_key(source, source_id)),
                );
            }
        }
        if let Some((source, source_id)) = source_pair(doc) {
            best_effort(
                "source index",
                index::put_unique(&mut self.kv, &index::source_key(source, source_id), doc.id),
            );
        }
        Ok(())
    }

    fn delete_document(&mut self, id: Uuid) -> Result<()> {
        let Some(doc) = self.load::<Document>(DOCUMENT, id)? else {
            return Ok(());
        };
        debug!("cascading delete of document {}", id);

        // Cascade children first, the document blob last
        let ann_key = index::children_key(DOCUMENT, ANNOTATION, id);
        for ann_id in index::read_ids(&self.kv, &ann_key)? {
            best_effort("annotation cascade", self.remove_entity(ANNOTATION, ann_id));
        }
        best_effort("annotation child index", self.kv.remove(&ann_key));

        let session_key = index::children_key(DOCUMENT, SESSION, id);
        for session_id in index::read_ids(&self.kv, &session_key)? {
            best_effort("session cascade", self.remove_entity(SESSION, session_id));
        }
        best_effort("session child index", self.kv.remove(&session_key));

        let card_key = index::children_key(DOCUMENT, FLASHCARD, id);
        for card_id in index::read_ids(&self.kv, &card_key)? {
            best_effort("flashcard cascade", self.delete_flashcard(card_id));
        }
        best_effort("flashcard child index", self.kv.remove(&card_key));

        // Drop membership in every collection holding the document
        let roster = index::read_ids(&self.kv, &index::roster_key(COLLECTION))?;
        for collection in self.load_many::<Collection>(COLLECTION, &roster)? {
            if collection.document_ids.contains(&id) {
                best_effort(
                    "collection membership",
                    self.remove_from_collection(collection.id, id),
                );
            }
        }

        if let Some(path) = &doc.path {
            best_effort("path index", self.kv.remove(&index::path_key(path)));
        }
        if let Some((source, source_id)) = source_pair(&doc) {
            best_effort(
                "source index",
                self.kv.remove(&index::source_key(source, source_id)),
            );
        }
        best_effort(
            "document roster",
            index::remove_id(&mut self.kv, &index::roster_key(DOCUMENT), id),
        );
        self.remove_entity(DOCUMENT, id)
    }

    // ==================== Tag Operations ====================

    fn list_tags(&self) -> Result<HashMap<String, usize>> {
        let docs = self.list_documents(&DocumentFilter::default())?;
        Ok(fold_tag_counts(docs.iter().map(|d| d.tags.as_slice())))
    }

    // ==================== Collection Operations ====================

    fn create_collection(&mut self, name: &str, description: &str) -> Result<Collection> {
        let existing = self.list_collections()?;
        if existing.iter().any(|c| c.name.eq_ignore_ascii_case(name)) {
            return Err(StoreError::duplicate("collection name", name));
        }
        let collection = Collection::new(name, description);
        self.save(COLLECTION, collection.id, &collection)?;
        best_effort(
            "collection roster",
            index::append_id(&mut self.kv, &index::roster_key(COLLECTION), collection.id),
        );
        Ok(collection)
    }

    fn get_collection(&self, id_or_name: &str) -> Result<Option<Collection>> {
        if let Ok(id) = Uuid::parse_str(id_or_name) {
            if let Some(collection) = self.load(COLLECTION, id)? {
                return Ok(Some(collection));
            }
        }
        let collections = self.list_collections()?;
        Ok(collections
            .into_iter()
            .find(|c| c.name.eq_ignore_ascii_case(id_or_name)))
    }

    fn list_collections(&self) -> Result<Vec<Collection>> {
        let ids = index::read_ids(&self.kv, &index::roster_key(COLLECTION))?;
        let mut collections = self.load_many::<Collection>(COLLECTION, &ids)?;
        sort_collections(&mut collections);
        Ok(collections)
    }

    fn add_to_collection(&mut self, collection_id: Uuid, document_id: Uuid) -> Result<()> {
        let mut collection = self
            .load::<Collection>(COLLECTION, collection_id)?
            .ok_or_else(|| StoreError::not_found("collection", collection_id))?;
        if self.get_document(document_id)?.is_none() {
            return Err(StoreError::missing_parent(
                "membership",
                "document",
                document_id,
            ));
        }
        if !collection.add_document(document_id) {
            return Ok(());
        }
        self.save(COLLECTION, collection.id, &collection)
    }

    fn remove_from_collection(&mut self, collection_id: Uuid, document_id: Uuid) -> Result<()> {
        let mut collection = self
            .load::<Collection>(COLLECTION, collection_id)?
            .ok_or_else(|| StoreError::not_found("collection", collection_id))?;
        if !collection.remove_document(document_id) {
            return Ok(());
        }
        self.save(COLLECTION, collection.id, &collection)
    }

    fn delete_collection(&mut self, id: Uuid) -> Result<()> {
        if self.load::<Collection>(COLLECTION, id)?.is_none() {
            return Ok(());
        }
        best_effort(
            "collection roster",
            index::remove_id(&mut self.kv, &index::roster_key(COLLECTION), id),
        );
        self.remove_entity(COLLECTION, id)
    }

    // ==================== Annotation Operations ====================

    fn add_annotation(&mut self, annotation: &mut Annotation) -> Result<()> {
        if self.get_document(annotation.document_id)?.is_none() {
            return Err(StoreError::missing_parent(
                "annotation",
                "document",
                annotation.document_id,
            ));
        }
        if annotation.id.is_nil() {
            annotation.id = Uuid::new_v4();
        }
        annotation.created_at = now_ms();
        self.save(ANNOTATION, annotation.id, annotation)?;
        best_effort(
            "annotation child index",
            index::append_id(
                &mut self.kv,
                &index::children_key(DOCUMENT, ANNOTATION, annotation.document_id),
                annotation.id,
            ),
        );
        Ok(())
    }

    fn get_annotations(&self, document_id: Uuid) -> Result<Vec<Annotation>> {
        let ids = index::read_ids(
            &self.kv,
            &index::children_key(DOCUMENT, ANNOTATION, document_id),
        )?;
        let mut annotations = self.load_many::<Annotation>(ANNOTATION, &ids)?;
        sort_annotations(&mut annotations);
        Ok(annotations)
    }

    fn delete_annotation(&mut self, id: Uuid) -> Result<()> {
        let Some(annotation) = self.load::<Annotation>(ANNOTATION, id)? else {
            return Ok(());
        };
        best_effort(
            "annotation child index",
            index::remove_id(
                &mut self.kv,
                &index::children_key(DOCUMENT, ANNOTATION, annotation.document_id),
                id,
            ),
        );
        self.remove_entity(ANNOTATION, id)
    }

    // ==================== Reading Session Operations ====================

    fn start_session(&mut self, document_id: Uuid) -> Result<ReadingSession> {
        if self.get_document(document_id)?.is_none() {
            return Err(StoreError::missing_parent(
                "session", "document", document_id,
            ));
        }
        let session = ReadingSession::new(document_id);
        self.save(SESSION, session.id, &session)?;
        best_effort(
            "session child index",
            index::append_id(
                &mut self.kv,
                &index::children_key(DOCUMENT, SESSION, document_id),
                session.id,
            ),
        );
        Ok(session)
    }

    fn end_session(&mut self, session_id: Uuid, pages_read: u32, notes: &str) -> Result<()> {
        let mut session = self
            .load::<ReadingSession>(SESSION, session_id)?
            .ok_or_else(|| StoreError::not_found("session", session_id))?;
        session.end_at = Some(now_ms());
        session.pages_read = pages_read;
        session.notes = notes.to_string();
        self.save(SESSION, session.id, &session)
    }

    fn list_sessions(&self, document_id: Uuid) -> Result<Vec<ReadingSession>> {
        let ids = index::read_ids(
            &self.kv,
            &index::children_key(DOCUMENT, SESSION, document_id),
        )?;
        let mut sessions = self.load_many::<ReadingSession>(SESSION, &ids)?;
        sort_sessions(&mut sessions);
        Ok(sessions)
    }

    // ==================== Flashcard Operations ====================

    fn add_flashcard(&mut self, card: &mut Flashcard) -> Result<()> {
        if let Some(document_id) = card.document_id {
            if self.get_document(document_id)?.is_none() {
                return Err(StoreError::missing_parent(
                    "flashcard",
                    "document",
                    document_id,
                ));
            }
        }
        if card.id.is_nil() {
            card.id = Uuid::new_v4();
        } else if self.load::<Flashcard>(FLASHCARD, card.id)?.is_some() {
            return Err(StoreError::duplicate("id", card.id));
        }
        let now = now_ms();
        card.created_at = now;
        card.updated_at = now;
        self.save(FLASHCARD, card.id, card)?;
        best_effort(
            "flashcard roster",
            index::append_id(&mut self.kv, &index::roster_key(FLASHCARD), card.id),
        );
        if let Some(document_id) = card.document_id {
            best_effort(
                "flashcard child index",
                index::append_id(
                    &mut self.kv,
                    &index::children_key(DOCUMENT, FLASHCARD, document_id),
                    card.id,
                ),
            );
        }
        Ok(())
    }

    fn get_flashcard(&self, id: Uuid) -> Result<Option<Flashcard>> {
        self.load(FLASHCARD, id)
    }

    fn list_flashcards(&self, filter: &FlashcardFilter) -> Result<Vec<Flashcard>> {
        let ids = index::read_ids(&self.kv, &index::roster_key(FLASHCARD))?;
        let mut cards: Vec<Flashcard> = self
            .load_many::<Flashcard>(FLASHCARD, &ids)?
            .into_iter()
            .filter(|card| matches_flashcard(card, filter))
            .collect();
        sort_flashcards(&mut cards);
        if let Some(limit) = filter.limit {
            cards.truncate(limit);
        }
        Ok(cards)
    }

    fn update_flashcard(&mut self, card: &mut Flashcard) -> Result<()> {
        let existing = self
            .load::<Flashcard>(FLASHCARD, card.id)?
            .ok_or_else(|| StoreError::not_found("flashcard", card.id))?;
        if card.document_id != existing.document_id {
            if let Some(document_id) = card.document_id {
                if self.get_document(document_id)?.is_none() {
                    return Err(StoreError::missing_parent(
                        "flashcard",
                        "document",
                        document_id,
                    ));
                }
            }
        }
        card.created_at = existing.created_at;
        card.touch();
        self.save(FLASHCARD, card.id, card)?;

        if existing.document_id != card.document_id {
            if let Some(old) = existing.document_id {
                best_effort(
                    "flashcard child index",
                    index::remove_id(
                        &mut self.kv,
                        &index::children_key(DOCUMENT, FLASHCARD, old),
                        card.id,
                    ),
                );
            }
            if let Some(new) = card.document_id {
                best_effort(
                    "flashcard child index",
                    index::append_id(
                        &mut self.kv,
                        &index::children_key(DOCUMENT, FLASHCARD, new),
                        card.id,
                    ),
                );
            }
        }
        Ok(())
    }

    fn delete_flashcard(&mut self, id: Uuid) -> Result<()> {
        let Some(card) = self.load::<Flashcard>(FLASHCARD, id)? else {
            return Ok(());
        };
        let review_key = index::children_key(FLASHCARD, REVIEW, id);
        for review_id in index::read_ids(&self.kv, &review_key)? {
            best_effort("review cascade", self.remove_entity(REVIEW, review_id));
        }
        best_effort("review child index", self.kv.remove(&review_key));
        if let Some(document_id) = card.document_id {
            best_effort(
                "flashcard child index",
                index::remove_id(
                    &mut self.kv,
                    &index::children_key(DOCUMENT, FLASHCARD, document_id),
                    id,
                ),
            );
        }
        best_effort(
            "flashcard roster",
            index::remove_id(&mut self.kv, &index::roster_key(FLASHCARD), id),
        );
        self.remove_entity(FLASHCARD, id)
    }

    fn review_flashcard(&mut self, id: Uuid, quality: u8) -> Result<Flashcard> {
        let quality = Quality::new(quality)?;
        let mut card = self
            .load::<Flashcard>(FLASHCARD, id)?
            .ok_or_else(|| StoreError::not_found("flashcard", id))?;

        let now = now_ms();
        let prev_interval = card.interval;
        let prev_ease = if card.ease <= 0.0 {
            INITIAL_EASE
        } else {
            card.ease
        };
        let schedule = next_schedule(card.interval, card.ease, quality, now);

        card.interval = schedule.interval;
        card.ease = schedule.ease;
        card.due_at = schedule.due_at;
        card.last_review = Some(now);
        card.updated_at = now;
        self.save(FLASHCARD, card.id, &card)?;

        // History is an audit trail; the card update already committed
        let review = FlashcardReview {
            id: Uuid::new_v4(),
            flashcard_id: card.id,
            quality: quality.value(),
            reviewed_at: now,
            prev_interval,
            prev_ease,
        };
        match self.save(REVIEW, review.id, &review) {
            Ok(()) => best_effort(
                "review child index",
                index::append_id(
                    &mut self.kv,
                    &index::children_key(FLASHCARD, REVIEW, card.id),
                    review.id,
                ),
            ),
            Err(err) => warn!("failed to record review for flashcard {}: {}", card.id, err),
        }
        Ok(card)
    }

    fn list_reviews(&self, flashcard_id: Uuid) -> Result<Vec<FlashcardReview>> {
        let ids = index::read_ids(
            &self.kv,
            &index::children_key(FLASHCARD, REVIEW, flashcard_id),
        )?;
        let mut reviews = self.load_many::<FlashcardReview>(REVIEW, &ids)?;
        sort_reviews(&mut reviews);
        Ok(reviews)
    }

    // ==================== Task Operations ====================

    fn add_task(&mut self, _task: &mut Task) -> Result<()> {
        Err(self.unsupported("tasks"))
    }

    fn get_task(&self, _id: Uuid) -> Result<Option<Task>> {
        Err(self.unsupported("tasks"))
    }

    fn list_tasks(&self, _filter: &TaskFilter) -> Result<Vec<Task>> {
        Err(self.unsupported("tasks"))
    }

    fn update_task(&mut self, _task: &mut Task) -> Result<()> {
        Err(self.unsupported("tasks"))
    }

    fn delete_task(&mut self, _id: Uuid) -> Result<()> {
        Err(self.unsupported("tasks"))
    }

    // ==================== Saved Search Operations ====================

    fn save_search(&mut self, _search: &mut SavedSearch) -> Result<()> {
        Err(self.unsupported("saved searches"))
    }

    fn get_saved_search(&self, _id_or_name: &str) -> Result<Option<SavedSearch>> {
        Err(self.unsupported("saved searches"))
    }

    fn list_saved_searches(&self) -> Result<Vec<SavedSearch>> {
        Err(self.unsupported("saved searches"))
    }

    fn delete_saved_search(&mut self, _id: Uuid) -> Result<()> {
        Err(self.unsupported("saved searches"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnnotationType, DocumentType};
    use tempfile::TempDir;

    fn memory_store() -> MemoryStore {
        MemoryStore::new()
    }

    fn add_doc(store: &mut MemoryStore, title: &str) -> Document {
        let mut doc = Document::new(title, DocumentType::Paper);
        store.add_document(&mut doc).unwrap();
        doc
    }

    #[test]
    fn test_add_assigns_id_and_stamps() {
        let mut store = memory_store();
        let mut doc = Document::new("Attention Is All You Need", DocumentType::Paper);
        doc.id = Uuid::nil();
        store.add_document(&mut doc).unwrap();

        assert!(!doc.id.is_nil());
        let got = store.get_document(doc.id).unwrap().unwrap();
        assert_eq!(got, doc);
    }

    #[test]
    fn test_get_missing_is_none() {
        let store = memory_store();
        assert!(store.get_document(Uuid::new_v4()).unwrap().is_none());
        assert!(store.get_document_by_path("/nope.pdf").unwrap().is_none());
        assert!(store
            .get_document_by_source_id("arxiv", "0000.00000")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let mut store = memory_store();
        let mut a = Document::new("A", DocumentType::Paper);
        a.path = Some("/papers/a.pdf".into());
        store.add_document(&mut a).unwrap();

        let mut b = Document::new("B", DocumentType::Paper);
        b.path = Some("/papers/a.pdf".into());
        let err = store.add_document(&mut b).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { field: "path", .. }));
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let mut store = memory_store();
        let mut a = Document::new("A", DocumentType::Paper);
        a.source = Some("arxiv".into());
        a.source_id = Some("1706.03762".into());
        store.add_document(&mut a).unwrap();

        let mut b = Document::new("B", DocumentType::Paper);
        b.source = Some("arxiv".into());
        b.source_id = Some("1706.03762".into());
        let err = store.add_document(&mut b).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { field: "source", .. }));

        // Same source, different ID is fine
        let mut c = Document::new("C", DocumentType::Paper);
        c.source = Some("arxiv".into());
        c.source_id = Some("2304.00067".into());
        store.add_document(&mut c).unwrap();
    }

    #[test]
    fn test_rating_validated() {
        let mut store = memory_store();
        let mut doc = Document::new("Rated", DocumentType::Book);
        doc.rating = Some(6);
        let err = store.add_document(&mut doc).unwrap_err();
        assert!(matches!(err, StoreError::RatingOutOfRange(6)));
    }

    #[test]
    fn test_update_retargets_path_index() {
        let mut store = memory_store();
        let mut doc = Document::new("Movable", DocumentType::Paper);
        doc.path = Some("/old.pdf".into());
        store.add_document(&mut doc).unwrap();

        doc.set_path(Some("/new.pdf".into()));
        store.update_document(&mut doc).unwrap();

        assert!(store.get_document_by_path("/old.pdf").unwrap().is_none());
        let found = store.get_document_by_path("/new.pdf").unwrap().unwrap();
        assert_eq!(found.id, doc.id);
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let mut store = memory_store();
        let mut doc = Document::new("Ghost", DocumentType::Note);
        let err = store.update_document(&mut doc).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_update_preserves_created_at() {
        let mut store = memory_store();
        let mut doc = add_doc(&mut store, "Stable");
        let created = doc.created_at;

        std::thread::sleep(std::time::Duration::from_millis(10));
        doc.set_notes("changed");
        store.update_document(&mut doc).unwrap();

        let got = store.get_document(doc.id).unwrap().unwrap();
        assert_eq!(got.created_at, created);
        assert!(got.updated_at > created);
    }

    #[test]
    fn test_list_documents_filters() {
        let mut store = memory_store();
        let mut paper = Document::new("Deep Learning Survey", DocumentType::Paper);
        paper.tags = vec!["ML".into()];
        paper.source = Some("arxiv".into());
        paper.source_id = Some("1".into());
        store.add_document(&mut paper).unwrap();

        let mut book = Document::new("Rust in Action", DocumentType::Book);
        book.tags = vec!["rust".into()];
        store.add_document(&mut book).unwrap();

        let by_tag = store
            .list_documents(&DocumentFilter {
                tag: Some("ml".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].id, paper.id);

        let by_type = store
            .list_documents(&DocumentFilter {
                doc_type: Some(DocumentType::Book),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].id, book.id);

        let by_source = store
            .list_documents(&DocumentFilter {
                source: Some("arxiv".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_source.len(), 1);

        let by_search = store
            .list_documents(&DocumentFilter {
                search: Some("rust".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_search.len(), 1);
        assert_eq!(by_search[0].id, book.id);

        let limited = store
            .list_documents(&DocumentFilter {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_list_orders_most_recent_first() {
        let mut store = memory_store();
        let first = add_doc(&mut store, "First");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = add_doc(&mut store, "Second");
        std::thread::sleep(std::time::Duration::from_millis(5));

        let mut refreshed = first.clone();
        refreshed.set_notes("bumped");
        store.update_document(&mut refreshed).unwrap();

        let docs = store.list_documents(&DocumentFilter::default()).unwrap();
        assert_eq!(docs[0].id, first.id);
        assert_eq!(docs[1].id, second.id);
    }

    #[test]
    fn test_delete_document_cascades() {
        let mut store = memory_store();
        let doc = add_doc(&mut store, "Parent");

        let mut ann = Annotation::new(doc.id, AnnotationType::Highlight, "key passage");
        store.add_annotation(&mut ann).unwrap();
        let session = store.start_session(doc.id).unwrap();
        let mut card = Flashcard::new("Q", "A");
        card.document_id = Some(doc.id);
        store.add_flashcard(&mut card).unwrap();
        store.review_flashcard(card.id, 5).unwrap();

        let collection = store.create_collection("Reading", "").unwrap();
        store.add_to_collection(collection.id, doc.id).unwrap();

        store.delete_document(doc.id).unwrap();

        assert!(store.get_document(doc.id).unwrap().is_none());
        assert!(store.get_annotations(doc.id).unwrap().is_empty());
        assert!(store.list_sessions(doc.id).unwrap().is_empty());
        assert!(store.get_flashcard(card.id).unwrap().is_none());
        assert!(store.list_reviews(card.id).unwrap().is_empty());
        let coll = store
            .get_collection(&collection.id.to_string())
            .unwrap()
            .unwrap();
        assert!(coll.document_ids.is_empty());

        // Session blob is gone too, not just unlisted
        let err = store.end_session(session.id, 1, "");
        assert!(err.unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut store = memory_store();
        let doc = add_doc(&mut store, "Once");
        store.delete_document(doc.id).unwrap();
        store.delete_document(doc.id).unwrap();
        store.delete_annotation(Uuid::new_v4()).unwrap();
        store.delete_flashcard(Uuid::new_v4()).unwrap();
        store.delete_collection(Uuid::new_v4()).unwrap();
    }

    #[test]
    fn test_deleted_path_is_reusable() {
        let mut store = memory_store();
        let mut a = Document::new("A", DocumentType::Paper);
        a.path = Some("/reuse.pdf".into());
        store.add_document(&mut a).unwrap();
        store.delete_document(a.id).unwrap();

        let mut b = Document::new("B", DocumentType::Paper);
        b.path = Some("/reuse.pdf".into());
        store.add_document(&mut b).unwrap();
        let found = store.get_document_by_path("/reuse.pdf").unwrap().unwrap();
        assert_eq!(found.id, b.id);
    }

    #[test]
    fn test_stale_unique_index_does_not_block_add() {
        let mut kv = MemoryKv::new();
        // Entries whose owner blob is gone, as left by a failed removal
        index::put_unique(
            &mut kv,
            "lectern:index:document:secondary:path:/ghost.pdf",
            Uuid::new_v4(),
        )
        .unwrap();
        index::put_unique(
            &mut kv,
            "lectern:index:document:secondary:source:arxiv:9999.00001",
            Uuid::new_v4(),
        )
        .unwrap();
        let mut store = KvStore::with_backend(kv);

        assert!(store.get_document_by_path("/ghost.pdf").unwrap().is_none());

        let mut doc = Document::new("Reclaimed", DocumentType::Paper);
        doc.path = Some("/ghost.pdf".into());
        doc.source = Some("arxiv".into());
        doc.source_id = Some("9999.00001".into());
        store.add_document(&mut doc).unwrap();

        let by_path = store.get_document_by_path("/ghost.pdf").unwrap().unwrap();
        assert_eq!(by_path.id, doc.id);
        let by_source = store
            .get_document_by_source_id("arxiv", "9999.00001")
            .unwrap()
            .unwrap();
        assert_eq!(by_source.id, doc.id);
    }

    #[test]
    fn test_update_reasserts_unique_index_claim() {
        let mut store = memory_store();
        let mut doc = Document::new("Claimed", DocumentType::Paper);
        doc.path = Some("/claimed.pdf".into());
        store.add_document(&mut doc).unwrap();

        // Point the entry at a dead id, as a failed removal would leave it
        index::put_unique(
            &mut store.kv,
            "lectern:index:document:secondary:path:/claimed.pdf",
            Uuid::new_v4(),
        )
        .unwrap();
        assert!(store
            .get_document_by_path("/claimed.pdf")
            .unwrap()
            .is_none());

        store.update_document(&mut doc).unwrap();
        let found = store
            .get_document_by_path("/claimed.pdf")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, doc.id);
    }

    #[test]
    fn test_unique_index_entry_for_moved_path_is_ignored() {
        let mut store = memory_store();
        let mut doc = Document::new("Moved", DocumentType::Paper);
        doc.path = Some("/new.pdf".into());
        store.add_document(&mut doc).unwrap();

        // A leftover entry naming a live document that no longer has
        // this path must neither resolve nor count as a duplicate
        index::put_unique(
            &mut store.kv,
            "lectern:index:document:secondary:path:/old.pdf",
            doc.id,
        )
        .unwrap();

        assert!(store.get_document_by_path("/old.pdf").unwrap().is_none());

        let mut other = Document::new("Other", DocumentType::Paper);
        other.path = Some("/old.pdf".into());
        store.add_document(&mut other).unwrap();
        let found = store.get_document_by_path("/old.pdf").unwrap().unwrap();
        assert_eq!(found.id, other.id);
    }

    #[test]
    fn test_tag_helpers() {
        let mut store = memory_store();
        let doc = add_doc(&mut store, "Tagged");
        let other = add_doc(&mut store, "Other");

        store.add_tag(other.id, "ml").unwrap();
        store.add_tag(other.id, "rust").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(3));
        store.add_tag(doc.id, "ML").unwrap();
        store.add_tag(doc.id, "ml").unwrap();

        let got = store.get_document(doc.id).unwrap().unwrap();
        assert_eq!(got.tags, vec!["ML"]);

        // The most recently updated document's spelling is reported
        let counts = store.list_tags().unwrap();
        assert_eq!(counts.get("ML"), Some(&2));
        assert_eq!(counts.get("rust"), Some(&1));

        store.remove_tag(doc.id, "mL").unwrap();
        let got = store.get_document(doc.id).unwrap().unwrap();
        assert!(got.tags.is_empty());

        // Missing document is an error, missing tag is not
        assert!(store.add_tag(Uuid::new_v4(), "x").unwrap_err().is_not_found());
        store.remove_tag(doc.id, "absent").unwrap();
    }

    #[test]
    fn test_collection_lifecycle() {
        let mut store = memory_store();
        let doc = add_doc(&mut store, "Member");

        let collection = store.create_collection("To Read", "queue").unwrap();
        let err = store.create_collection("to read", "").unwrap_err();
        assert!(matches!(
            err,
            StoreError::Duplicate {
                field: "collection name",
                ..
            }
        ));

        // Lookup by ID and by name, case-insensitively
        assert!(store
            .get_collection(&collection.id.to_string())
            .unwrap()
            .is_some());
        assert!(store.get_collection("TO READ").unwrap().is_some());
        assert!(store.get_collection("absent").unwrap().is_none());

        store.add_to_collection(collection.id, doc.id).unwrap();
        store.add_to_collection(collection.id, doc.id).unwrap();
        let got = store.get_collection("To Read").unwrap().unwrap();
        assert_eq!(got.document_ids, vec![doc.id]);

        let err = store
            .add_to_collection(collection.id, Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingParent { .. }));

        store.remove_from_collection(collection.id, doc.id).unwrap();
        store.remove_from_collection(collection.id, doc.id).unwrap();

        // Deleting the collection leaves the document alone
        store.add_to_collection(collection.id, doc.id).unwrap();
        store.delete_collection(collection.id).unwrap();
        assert!(store.get_document(doc.id).unwrap().is_some());
        assert!(store.list_collections().unwrap().is_empty());
    }

    #[test]
    fn test_collections_sorted_by_name() {
        let mut store = memory_store();
        store.create_collection("zebra", "").unwrap();
        store.create_collection("Apple", "").unwrap();
        store.create_collection("mango", "").unwrap();

        let names: Vec<String> = store
            .list_collections()
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Apple", "mango", "zebra"]);
    }

    #[test]
    fn test_annotation_requires_document() {
        let mut store = memory_store();
        let mut ann = Annotation::new(Uuid::new_v4(), AnnotationType::Note, "orphan");
        let err = store.add_annotation(&mut ann).unwrap_err();
        assert!(matches!(
            err,
            StoreError::MissingParent {
                child: "annotation",
                ..
            }
        ));
    }

    #[test]
    fn test_annotations_sorted_by_page_then_time() {
        let mut store = memory_store();
        let doc = add_doc(&mut store, "Annotated");

        let mut unpaged = Annotation::new(doc.id, AnnotationType::Note, "general");
        store.add_annotation(&mut unpaged).unwrap();
        let mut page_nine = Annotation::new(doc.id, AnnotationType::Highlight, "late");
        page_nine.page = Some(9);
        store.add_annotation(&mut page_nine).unwrap();
        let mut page_two = Annotation::new(doc.id, AnnotationType::Highlight, "early");
        page_two.page = Some(2);
        store.add_annotation(&mut page_two).unwrap();

        let anns = store.get_annotations(doc.id).unwrap();
        let pages: Vec<Option<u32>> = anns.iter().map(|a| a.page).collect();
        assert_eq!(pages, vec![Some(2), Some(9), None]);
    }

    #[test]
    fn test_session_lifecycle() {
        let mut store = memory_store();
        let doc = add_doc(&mut store, "Reading");

        let session = store.start_session(doc.id).unwrap();
        assert!(session.end_at.is_none());

        store.end_session(session.id, 42, "good pace").unwrap();
        let sessions = store.list_sessions(doc.id).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].pages_read, 42);
        assert_eq!(sessions[0].notes, "good pace");
        assert!(sessions[0].end_at.is_some());

        let err = store.end_session(Uuid::new_v4(), 0, "").unwrap_err();
        assert!(err.is_not_found());

        let err = store.start_session(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, StoreError::MissingParent { .. }));
    }

    #[test]
    fn test_review_flow() {
        let mut store = memory_store();
        let mut card = Flashcard::new("capital of France?", "Paris");
        store.add_flashcard(&mut card).unwrap();

        let after_first = store.review_flashcard(card.id, 4).unwrap();
        assert_eq!(after_first.interval, 1);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let after_second = store.review_flashcard(card.id, 4).unwrap();
        assert_eq!(after_second.interval, 6);
        assert!(after_second.last_review.is_some());

        let reviews = store.list_reviews(card.id).unwrap();
        assert_eq!(reviews.len(), 2);
        // Most recent first; snapshots show the pre-review state
        assert_eq!(reviews[0].prev_interval, 1);
        assert_eq!(reviews[1].prev_interval, 0);
        assert_eq!(reviews[1].prev_ease, INITIAL_EASE);

        let err = store.review_flashcard(card.id, 6).unwrap_err();
        assert!(matches!(err, StoreError::QualityOutOfRange(6)));
        let err = store.review_flashcard(Uuid::new_v4(), 3).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_due_flashcards() {
        let mut store = memory_store();
        let mut due_now = Flashcard::new("due", "now");
        store.add_flashcard(&mut due_now).unwrap();

        let mut future = Flashcard::new("later", "much");
        store.add_flashcard(&mut future).unwrap();
        // Push it a week out
        store.review_flashcard(future.id, 5).unwrap();
        store.review_flashcard(future.id, 5).unwrap();

        let due = store.list_due_flashcards(now_ms(), None).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, due_now.id);
    }

    #[test]
    fn test_flashcard_filter_by_document_and_tag() {
        let mut store = memory_store();
        let doc = add_doc(&mut store, "Source");

        let mut attached = Flashcard::new("Q1", "A1");
        attached.document_id = Some(doc.id);
        attached.tags = vec!["anatomy".into()];
        store.add_flashcard(&mut attached).unwrap();

        let mut loose = Flashcard::new("Q2", "A2");
        store.add_flashcard(&mut loose).unwrap();

        let for_doc = store
            .list_flashcards(&FlashcardFilter {
                document_id: Some(doc.id),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(for_doc.len(), 1);
        assert_eq!(for_doc[0].id, attached.id);

        let by_tag = store
            .list_flashcards(&FlashcardFilter {
                tag: Some("ANATOMY".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_tag.len(), 1);

        let err = {
            let mut orphan = Flashcard::new("Q3", "A3");
            orphan.document_id = Some(Uuid::new_v4());
            store.add_flashcard(&mut orphan).unwrap_err()
        };
        assert!(matches!(err, StoreError::MissingParent { .. }));
    }

    #[test]
    fn test_tasks_and_saved_searches_unsupported() {
        let mut store = memory_store();
        let mut task = Task::new("read chapter 3");
        let err = store.add_task(&mut task).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Unsupported {
                entity: "tasks",
                backend: "memory",
            }
        ));
        assert!(err.to_string().contains("sqlite"));

        let mut search = SavedSearch::new("ml papers", "attention");
        let err = store.save_search(&mut search).unwrap_err();
        assert!(matches!(err, StoreError::Unsupported { .. }));
    }

    #[test]
    fn test_corrupt_roster_recovers() {
        let mut kv = MemoryKv::new();
        kv.put("lectern:index:document", b"definitely not json")
            .unwrap();
        let mut store = KvStore::with_backend(kv);

        assert!(store.list_documents(&DocumentFilter::default()).unwrap().is_empty());

        let doc = add_doc(&mut store, "Recovered");
        let docs = store.list_documents(&DocumentFilter::default()).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, doc.id);
    }

    #[test]
    fn test_stale_roster_entry_skipped() {
        let mut kv = MemoryKv::new();
        let ghost = Uuid::new_v4().to_string();
        let blob = serde_json::to_vec(&vec![ghost]).unwrap();
        kv.put("lectern:index:document", &blob).unwrap();
        let mut store = KvStore::with_backend(kv);

        assert!(store.list_documents(&DocumentFilter::default()).unwrap().is_empty());
        add_doc(&mut store, "Real");
        assert_eq!(store.list_documents(&DocumentFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_sled_store_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("kv");

        let doc_id;
        {
            let mut store = SledStore::open(&path).unwrap();
            let mut doc = Document::new("Durable", DocumentType::Book);
            doc.path = Some("/shelf/durable.epub".into());
            store.add_document(&mut doc).unwrap();
            doc_id = doc.id;

            let mut card = Flashcard::new("Q", "A");
            card.document_id = Some(doc_id);
            store.add_flashcard(&mut card).unwrap();
        }

        let store = SledStore::open(&path).unwrap();
        let docs = store.list_documents(&DocumentFilter::default()).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, doc_id);
        assert_eq!(docs[0].title, "Durable");

        let found = store
            .get_document_by_path("/shelf/durable.epub")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, doc_id);

        let cards = store
            .list_flashcards(&FlashcardFilter {
                document_id: Some(doc_id),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(cards.len(), 1);
    }
}
