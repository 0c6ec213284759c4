//! Relational storage engine over SQLite
//!
//! The reference engine: every entity kind is supported, uniqueness
//! and cascade live in the schema, and full-text search goes through
//! FTS5 with porter stemming. Uniqueness violations are pre-checked
//! with SELECTs so callers get typed errors instead of raw constraint
//! failures; the schema constraints remain as a backstop.
//!
//! Search semantics differ from the KV engine on purpose: FTS5
//! matches stemmed tokens while the KV engine does substring matching
//! over the same fields.

pub mod schema;

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::models::{
    now_ms, Annotation, AnnotationType, Collection, Document, DocumentType, Flashcard,
    FlashcardReview, FlashcardType, ReadingSession, ReadingStatus, SavedSearch, Task,
    TaskPriority, TaskStatus,
};
use crate::scheduler::{next_schedule, Quality, INITIAL_EASE};
use crate::store::{
    fold_tag_counts, validate_document, DocumentFilter, FlashcardFilter, LibraryStore, TaskFilter,
};

const DOCUMENT_COLUMNS: &str = "d.id, d.type, d.path, d.source, d.source_id, d.title, d.authors, \
     d.abstract, d.full_text, d.tags, d.notes, d.rating, d.status, d.read_at, d.meta, \
     d.created_at, d.updated_at";

const FLASHCARD_COLUMNS: &str =
    "id, document_id, type, front, back, cloze, tags, due_at, interval, ease, last_review, \
     created_at, updated_at";

// ==================== Time Helpers ====================

fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn opt_ms(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(to_ms)
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(now_ms)
}

fn from_opt_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}

// ==================== Row Types ====================

struct DocumentRow {
    id: String,
    doc_type: String,
    path: Option<String>,
    source: Option<String>,
    source_id: Option<String>,
    title: String,
    authors: String,
    abstract_text: String,
    full_text: String,
    tags: String,
    notes: String,
    rating: Option<i64>,
    status: String,
    read_at: Option<i64>,
    meta: String,
    created_at: i64,
    updated_at: i64,
}

fn document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRow> {
    Ok(DocumentRow {
        id: row.get(0)?,
        doc_type: row.get(1)?,
        path: row.get(2)?,
        source: row.get(3)?,
        source_id: row.get(4)?,
        title: row.get(5)?,
        authors: row.get(6)?,
        abstract_text: row.get(7)?,
        full_text: row.get(8)?,
        tags: row.get(9)?,
        notes: row.get(10)?,
        rating: row.get(11)?,
        status: row.get(12)?,
        read_at: row.get(13)?,
        meta: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

fn hydrate_document(row: DocumentRow) -> Result<Document> {
    Ok(Document {
        id: Uuid::parse_str(&row.id)?,
        doc_type: DocumentType::parse(&row.doc_type),
        path: row.path,
        source: row.source,
        source_id: row.source_id,
        title: row.title,
        authors: serde_json::from_str(&row.authors).unwrap_or_default(),
        abstract_text: row.abstract_text,
        full_text: row.full_text,
        tags: serde_json::from_str(&row.tags).unwrap_or_default(),
        notes: row.notes,
        rating: row.rating.map(|r| r as u8),
        status: ReadingStatus::parse(&row.status),
        read_at: from_opt_ms(row.read_at),
        meta: serde_json::from_str(&row.meta).unwrap_or_default(),
        created_at: from_ms(row.created_at),
        updated_at: from_ms(row.updated_at),
    })
}

struct CollectionRow {
    id: String,
    name: String,
    description: String,
    created_at: i64,
    updated_at: i64,
}

fn collection_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CollectionRow> {
    Ok(CollectionRow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

struct FlashcardRow {
    id: String,
    document_id: Option<String>,
    card_type: String,
    front: String,
    back: String,
    cloze: String,
    tags: String,
    due_at: i64,
    interval: i64,
    ease: f64,
    last_review: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

fn flashcard_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlashcardRow> {
    Ok(FlashcardRow {
        id: row.get(0)?,
        document_id: row.get(1)?,
        card_type: row.get(2)?,
        front: row.get(3)?,
        back: row.get(4)?,
        cloze: row.get(5)?,
        tags: row.get(6)?,
        due_at: row.get(7)?,
        interval: row.get(8)?,
        ease: row.get(9)?,
        last_review: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn hydrate_flashcard(row: FlashcardRow) -> Result<Flashcard> {
    Ok(Flashcard {
        id: Uuid::parse_str(&row.id)?,
        document_id: row
            .document_id
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()?,
        card_type: FlashcardType::parse(&row.card_type),
        front: row.front,
        back: row.back,
        cloze: row.cloze,
        tags: serde_json::from_str(&row.tags).unwrap_or_default(),
        due_at: from_ms(row.due_at),
        interval: row.interval as u32,
        ease: row.ease,
        last_review: from_opt_ms(row.last_review),
        created_at: from_ms(row.created_at),
        updated_at: from_ms(row.updated_at),
    })
}

/// Library store backed by a SQLite database
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the SQLite database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        if schema::needs_init(&conn) {
            info!("initializing sqlite schema version {} at {:?}", schema::SCHEMA_VERSION, path);
            schema::init_schema(&conn)?;
        }
        debug!("opened sqlite store at {:?}", path);

        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ==================== Private Helpers ====================

    fn document_exists(&self, id: Uuid) -> Result<bool> {
        let mut stmt = self.conn.prepare("SELECT 1 FROM documents WHERE id = ?1")?;
        Ok(stmt.exists(params![id.to_string()])?)
    }

    fn collection_exists(&self, id: Uuid) -> Result<bool> {
        let mut stmt = self.conn.prepare("SELECT 1 FROM collections WHERE id = ?1")?;
        Ok(stmt.exists(params![id.to_string()])?)
    }

    fn document_where(&self, clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Option<Document>> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents d WHERE {clause}");
        let row = self.conn.query_row(&sql, args, document_row).optional()?;
        match row {
            Some(row) => Ok(Some(hydrate_document(row)?)),
            None => Ok(None),
        }
    }

    /// Reject path or source pairs already claimed by another document
    fn check_unique_document(&self, doc: &Document) -> Result<()> {
        if let Some(path) = &doc.path {
            let mut stmt = self
                .conn
                .prepare("SELECT 1 FROM documents WHERE path = ?1 AND id != ?2")?;
            if stmt.exists(params![path, doc.id.to_string()])? {
                return Err(StoreError::duplicate("path", path));
            }
        }
        if let (Some(source), Some(source_id)) = (&doc.source, &doc.source_id) {
            let mut stmt = self.conn.prepare(
                "SELECT 1 FROM documents WHERE source = ?1 AND source_id = ?2 AND id != ?3",
            )?;
            if stmt.exists(params![source, source_id, doc.id.to_string()])? {
                return Err(StoreError::duplicate(
                    "source",
                    format!("{source}:{source_id}"),
                ));
            }
        }
        Ok(())
    }

    /// Hydrate a collection with its membership list
    fn hydrate_collection(&self, row: CollectionRow) -> Result<Collection> {
        let mut stmt = self.conn.prepare(
            "SELECT document_id FROM collection_documents WHERE collection_id = ?1 ORDER BY position",
        )?;
        let members = stmt
            .query_map(params![row.id], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        let mut document_ids = Vec::with_capacity(members.len());
        for member in members {
            document_ids.push(Uuid::parse_str(&member)?);
        }

        Ok(Collection {
            id: Uuid::parse_str(&row.id)?,
            name: row.name,
            description: row.description,
            document_ids,
            created_at: from_ms(row.created_at),
            updated_at: from_ms(row.updated_at),
        })
    }

    fn touch_collection(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE collections SET updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), to_ms(now)],
        )?;
        Ok(())
    }

    fn insert_review(&self, review: &FlashcardReview) -> Result<()> {
        self.conn.execute(
            "INSERT INTO flashcard_reviews (id, flashcard_id, quality, reviewed_at, prev_interval, prev_ease)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                review.id.to_string(),
                review.flashcard_id.to_string(),
                review.quality,
                to_ms(review.reviewed_at),
                review.prev_interval,
                review.prev_ease,
            ],
        )?;
        Ok(())
    }
}

impl LibraryStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    // ==================== Document Operations ====================

    fn add_document(&mut self, doc: &mut Document) -> Result<()> {
        validate_document(doc)?;
        if doc.id.is_nil() {
            doc.id = Uuid::new_v4();
        } else if self.document_exists(doc.id)? {
            return Err(StoreError::duplicate("id", doc.id));
        }
        self.check_unique_document(doc)?;

        let now = now_ms();
        doc.created_at = now;
        doc.updated_at = now;

        self.conn.execute(
            r#"
            INSERT INTO documents (id, type, path, source, source_id, title, authors, abstract,
                                   full_text, tags, notes, rating, status, read_at, meta,
                                   created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            params![
                doc.id.to_string(),
                doc.doc_type.as_str(),
                doc.path,
                doc.source,
                doc.source_id,
                doc.title,
                serde_json::to_string(&doc.authors)?,
                doc.abstract_text,
                doc.full_text,
                serde_json::to_string(&doc.tags)?,
                doc.notes,
                doc.rating,
                doc.status.as_str(),
                opt_ms(doc.read_at),
                serde_json::to_string(&doc.meta)?,
                to_ms(doc.created_at),
                to_ms(doc.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        self.document_where("d.id = ?1", &[&id.to_string()])
    }

    fn get_document_by_path(&self, path: &str) -> Result<Option<Document>> {
        self.document_where("d.path = ?1", &[&path])
    }

    fn get_document_by_source_id(&self, source: &str, source_id: &str) -> Result<Option<Document>> {
        self.document_where("d.source = ?1 AND d.source_id = ?2", &[&source, &source_id])
    }

    fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>> {
        let mut sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents d");
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Value> = Vec::new();

        if let Some(search) = &filter.search {
            sql.push_str(" JOIN documents_fts fts ON d.rowid = fts.rowid");
            clauses.push("documents_fts MATCH ?".to_string());
            args.push(Value::Text(search.clone()));
        }
        if let Some(tag) = &filter.tag {
            clauses.push(
                "EXISTS (SELECT 1 FROM json_each(d.tags) WHERE lower(json_each.value) = lower(?))"
                    .to_string(),
            );
            args.push(Value::Text(tag.clone()));
        }
        if let Some(source) = &filter.source {
            clauses.push("d.source = ?".to_string());
            args.push(Value::Text(source.clone()));
        }
        if let Some(doc_type) = filter.doc_type {
            clauses.push("d.type = ?".to_string());
            args.push(Value::Text(doc_type.as_str().to_string()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY d.updated_at DESC, d.id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), document_row)?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(hydrate_document(row?)?);
        }
        Ok(docs)
    }

    fn update_document(&mut self, doc: &mut Document) -> Result<()> {
        validate_document(doc)?;
        let existing = self
            .get_document(doc.id)?
            .ok_or_else(|| StoreError::not_found("document", doc.id))?;
        self.check_unique_document(doc)?;

        doc.created_at = existing.created_at;
        doc.touch();

        self.conn.execute(
            r#"
            UPDATE documents
            SET type = ?2, path = ?3, source = ?4, source_id = ?5, title = ?6, authors = ?7,
                abstract = ?8, full_text = ?9, tags = ?10, notes = ?11, rating = ?12,
                status = ?13, read_at = ?14, meta = ?15, updated_at = ?16
            WHERE id = ?1
            "#,
            params![
                doc.id.to_string(),
                doc.doc_type.as_str(),
                doc.path,
                doc.source,
                doc.source_id,
                doc.title,
                serde_json::to_string(&doc.authors)?,
                doc.abstract_text,
                doc.full_text,
                serde_json::to_string(&doc.tags)?,
                doc.notes,
                doc.rating,
                doc.status.as_str(),
                opt_ms(doc.read_at),
                serde_json::to_string(&doc.meta)?,
                to_ms(doc.updated_at),
            ],
        )?;
        Ok(())
    }

    fn delete_document(&mut self, id: Uuid) -> Result<()> {
        // Annotations, sessions, flashcards, reviews, and membership
        // rows go with it via ON DELETE CASCADE
        self.conn.execute(
            "DELETE FROM documents WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    // ==================== Tag Operations ====================

    fn list_tags(&self) -> Result<HashMap<String, usize>> {
        // Folded in document listing order so every backend reports the
        // same canonical spelling per case-folded tag
        let mut stmt = self
            .conn
            .prepare("SELECT tags FROM documents ORDER BY updated_at DESC, id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut lists: Vec<Vec<String>> = Vec::new();
        for row in rows {
            lists.push(serde_json::from_str(&row?).unwrap_or_default());
        }
        Ok(fold_tag_counts(lists.iter().map(|l| l.as_slice())))
    }

    // ==================== Collection Operations ====================

    fn create_collection(&mut self, name: &str, description: &str) -> Result<Collection> {
        // Name comparison is case-insensitive via the column collation
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM collections WHERE name = ?1")?;
        if stmt.exists(params![name])? {
            return Err(StoreError::duplicate("collection name", name));
        }

        let collection = Collection::new(name, description);
        self.conn.execute(
            "INSERT INTO collections (id, name, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                collection.id.to_string(),
                collection.name,
                collection.description,
                to_ms(collection.created_at),
                to_ms(collection.updated_at),
            ],
        )?;
        Ok(collection)
    }

    fn get_collection(&self, id_or_name: &str) -> Result<Option<Collection>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, description, created_at, updated_at
                 FROM collections WHERE id = ?1 OR name = ?1",
                params![id_or_name],
                collection_row,
            )
            .optional()?;
        match row {
            Some(row) => Ok(Some(self.hydrate_collection(row)?)),
            None => Ok(None),
        }
    }

    fn list_collections(&self) -> Result<Vec<Collection>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, description, created_at, updated_at
             FROM collections ORDER BY name ASC, id ASC",
        )?;
        let rows = stmt.query_map([], collection_row)?;

        let mut collections = Vec::new();
        for row in rows {
            collections.push(self.hydrate_collection(row?)?);
        }
        Ok(collections)
    }

    fn add_to_collection(&mut self, collection_id: Uuid, document_id: Uuid) -> Result<()> {
        if !self.collection_exists(collection_id)? {
            return Err(StoreError::not_found("collection", collection_id));
        }
        if !self.document_exists(document_id)? {
            return Err(StoreError::missing_parent(
                "membership",
                "document",
                document_id,
            ));
        }

        let now = now_ms();
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO collection_documents (collection_id, document_id, position, added_at)
            VALUES (?1, ?2,
                    (SELECT COALESCE(MAX(position), -1) + 1
                     FROM collection_documents WHERE collection_id = ?1),
                    ?3)
            "#,
            params![collection_id.to_string(), document_id.to_string(), to_ms(now)],
        )?;
        if inserted > 0 {
            self.touch_collection(collection_id, now)?;
        }
        Ok(())
    }

    fn remove_from_collection(&mut self, collection_id: Uuid, document_id: Uuid) -> Result<()> {
        if !self.collection_exists(collection_id)? {
            return Err(StoreError::not_found("collection", collection_id));
        }
        let removed = self.conn.execute(
            "DELETE FROM collection_documents WHERE collection_id = ?1 AND document_id = ?2",
            params![collection_id.to_string(), document_id.to_string()],
        )?;
        if removed > 0 {
            self.touch_collection(collection_id, now_ms())?;
        }
        Ok(())
    }

    fn delete_collection(&mut self, id: Uuid) -> Result<()> {
        // Membership rows cascade; documents and tasks stay (tasks
        // keep a NULL collection)
        self.conn.execute(
            "DELETE FROM collections WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    // ==================== Annotation Operations ====================

    fn add_annotation(&mut self, annotation: &mut Annotation) -> Result<()> {
        if !self.document_exists(annotation.document_id)? {
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

        self.conn.execute(
            "INSERT INTO annotations (id, document_id, type, content, page, position, color, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                annotation.id.to_string(),
                annotation.document_id.to_string(),
                annotation.annotation_type.as_str(),
                annotation.content,
                annotation.page,
                annotation.position,
                annotation.color,
                to_ms(annotation.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_annotations(&self, document_id: Uuid) -> Result<Vec<Annotation>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, document_id, type, content, page, position, color, created_at
             FROM annotations WHERE document_id = ?1
             ORDER BY page IS NULL, page ASC, created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![document_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut annotations = Vec::new();
        for row in rows {
            let (id, doc_id, kind, content, page, position, color, created_at) = row?;
            annotations.push(Annotation {
                id: Uuid::parse_str(&id)?,
                document_id: Uuid::parse_str(&doc_id)?,
                annotation_type: AnnotationType::parse(&kind),
                content,
                page: page.map(|p| p as u32),
                position,
                color,
                created_at: from_ms(created_at),
            });
        }
        Ok(annotations)
    }

    fn delete_annotation(&mut self, id: Uuid) -> Result<()> {
        self.conn.execute(
            "DELETE FROM annotations WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    // ==================== Reading Session Operations ====================

    fn start_session(&mut self, document_id: Uuid) -> Result<ReadingSession> {
        if !self.document_exists(document_id)? {
            return Err(StoreError::missing_parent(
                "session", "document", document_id,
            ));
        }
        let session = ReadingSession::new(document_id);
        self.conn.execute(
            "INSERT INTO reading_sessions (id, document_id, start_at, end_at, pages_read, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id.to_string(),
                session.document_id.to_string(),
                to_ms(session.start_at),
                opt_ms(session.end_at),
                session.pages_read,
                session.notes,
            ],
        )?;
        Ok(session)
    }

    fn end_session(&mut self, session_id: Uuid, pages_read: u32, notes: &str) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE reading_sessions SET end_at = ?2, pages_read = ?3, notes = ?4 WHERE id = ?1",
            params![session_id.to_string(), to_ms(now_ms()), pages_read, notes],
        )?;
        if updated == 0 {
            return Err(StoreError::not_found("session", session_id));
        }
        Ok(())
    }

    fn list_sessions(&self, document_id: Uuid) -> Result<Vec<ReadingSession>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, document_id, start_at, end_at, pages_read, notes
             FROM reading_sessions WHERE document_id = ?1
             ORDER BY start_at DESC, id ASC",
        )?;
        let rows = stmt.query_map(params![document_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (id, doc_id, start_at, end_at, pages_read, notes) = row?;
            sessions.push(ReadingSession {
                id: Uuid::parse_str(&id)?,
                document_id: Uuid::parse_str(&doc_id)?,
                start_at: from_ms(start_at),
                end_at: from_opt_ms(end_at),
                pages_read: pages_read as u32,
                notes,
            });
        }
        Ok(sessions)
    }

    // ==================== Flashcard Operations ====================

    fn add_flashcard(&mut self, card: &mut Flashcard) -> Result<()> {
        if let Some(document_id) = card.document_id {
            if !self.document_exists(document_id)? {
                return Err(StoreError::missing_parent(
                    "flashcard",
                    "document",
                    document_id,
                ));
            }
        }
        if card.id.is_nil() {
            card.id = Uuid::new_v4();
        } else if self.get_flashcard(card.id)?.is_some() {
            return Err(StoreError::duplicate("id", card.id));
        }

        let now = now_ms();
        card.created_at = now;
        card.updated_at = now;

        self.conn.execute(
            &format!(
                "INSERT INTO flashcards ({FLASHCARD_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                card.id.to_string(),
                card.document_id.map(|id| id.to_string()),
                card.card_type.as_str(),
                card.front,
                card.back,
                card.cloze,
                serde_json::to_string(&card.tags)?,
                to_ms(card.due_at),
                card.interval,
                card.ease,
                opt_ms(card.last_review),
                to_ms(card.created_at),
                to_ms(card.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get_flashcard(&self, id: Uuid) -> Result<Option<Flashcard>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {FLASHCARD_COLUMNS} FROM flashcards WHERE id = ?1"),
                params![id.to_string()],
                flashcard_row,
            )
            .optional()?;
        match row {
            Some(row) => Ok(Some(hydrate_flashcard(row)?)),
            None => Ok(None),
        }
    }

    fn list_flashcards(&self, filter: &FlashcardFilter) -> Result<Vec<Flashcard>> {
        let mut sql = format!("SELECT {FLASHCARD_COLUMNS} FROM flashcards");
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Value> = Vec::new();

        if let Some(document_id) = filter.document_id {
            clauses.push("document_id = ?".to_string());
            args.push(Value::Text(document_id.to_string()));
        }
        if let Some(tag) = &filter.tag {
            clauses.push(
                "EXISTS (SELECT 1 FROM json_each(tags) WHERE lower(json_each.value) = lower(?))"
                    .to_string(),
            );
            args.push(Value::Text(tag.clone()));
        }
        if let Some(due_before) = filter.due_before {
            clauses.push("due_at <= ?".to_string());
            args.push(Value::Integer(to_ms(due_before)));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY due_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), flashcard_row)?;

        let mut cards = Vec::new();
        for row in rows {
            cards.push(hydrate_flashcard(row?)?);
        }
        Ok(cards)
    }

    fn update_flashcard(&mut self, card: &mut Flashcard) -> Result<()> {
        let existing = self
            .get_flashcard(card.id)?
            .ok_or_else(|| StoreError::not_found("flashcard", card.id))?;
        if card.document_id != existing.document_id {
            if let Some(document_id) = card.document_id {
                if !self.document_exists(document_id)? {
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

        self.conn.execute(
            r#"
            UPDATE flashcards
            SET document_id = ?2, type = ?3, front = ?4, back = ?5, cloze = ?6, tags = ?7,
                due_at = ?8, interval = ?9, ease = ?10, last_review = ?11, updated_at = ?12
            WHERE id = ?1
            "#,
            params![
                card.id.to_string(),
                card.document_id.map(|id| id.to_string()),
                card.card_type.as_str(),
                card.front,
                card.back,
                card.cloze,
                serde_json::to_string(&card.tags)?,
                to_ms(card.due_at),
                card.interval,
                card.ease,
                opt_ms(card.last_review),
                to_ms(card.updated_at),
            ],
        )?;
        Ok(())
    }

    fn delete_flashcard(&mut self, id: Uuid) -> Result<()> {
        // Review history cascades
        self.conn.execute(
            "DELETE FROM flashcards WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    fn review_flashcard(&mut self, id: Uuid, quality: u8) -> Result<Flashcard> {
        let quality = Quality::new(quality)?;
        let mut card = self
            .get_flashcard(id)?
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

        self.conn.execute(
            "UPDATE flashcards
             SET due_at = ?2, interval = ?3, ease = ?4, last_review = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                card.id.to_string(),
                to_ms(card.due_at),
                card.interval,
                card.ease,
                opt_ms(card.last_review),
                to_ms(card.updated_at),
            ],
        )?;

        // History is an audit trail; the card update already committed
        let review = FlashcardReview {
            id: Uuid::new_v4(),
            flashcard_id: card.id,
            quality: quality.value(),
            reviewed_at: now,
            prev_interval,
            prev_ease,
        };
        if let Err(err) = self.insert_review(&review) {
            warn!("failed to record review for flashcard {}: {}", card.id, err);
        }
        Ok(card)
    }

    fn list_reviews(&self, flashcard_id: Uuid) -> Result<Vec<FlashcardReview>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, flashcard_id, quality, reviewed_at, prev_interval, prev_ease
             FROM flashcard_reviews WHERE flashcard_id = ?1
             ORDER BY reviewed_at DESC, id ASC",
        )?;
        let rows = stmt.query_map(params![flashcard_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, f64>(5)?,
            ))
        })?;

        let mut reviews = Vec::new();
        for row in rows {
            let (id, card_id, quality, reviewed_at, prev_interval, prev_ease) = row?;
            reviews.push(FlashcardReview {
                id: Uuid::parse_str(&id)?,
                flashcard_id: Uuid::parse_str(&card_id)?,
                quality: quality as u8,
                reviewed_at: from_ms(reviewed_at),
                prev_interval: prev_interval as u32,
                prev_ease,
            });
        }
        Ok(reviews)
    }

    // ==================== Task Operations ====================

    fn add_task(&mut self, task: &mut Task) -> Result<()> {
        if let Some(collection_id) = task.collection_id {
            if !self.collection_exists(collection_id)? {
                return Err(StoreError::missing_parent(
                    "task",
                    "collection",
                    collection_id,
                ));
            }
        }
        if task.id.is_nil() {
            task.id = Uuid::new_v4();
        } else if self.get_task(task.id)?.is_some() {
            return Err(StoreError::duplicate("id", task.id));
        }

        let now = now_ms();
        task.created_at = now;
        task.updated_at = now;

        self.conn.execute(
            "INSERT INTO tasks (id, description, collection_id, status, priority, tags, due_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task.id.to_string(),
                task.description,
                task.collection_id.map(|id| id.to_string()),
                task.status.as_str(),
                task.priority.as_str(),
                serde_json::to_string(&task.tags)?,
                opt_ms(task.due_at),
                to_ms(task.created_at),
                to_ms(task.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, description, collection_id, status, priority, tags, due_at, created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![id.to_string()],
                task_row,
            )
            .optional()?;
        match row {
            Some(row) => Ok(Some(hydrate_task(row)?)),
            None => Ok(None),
        }
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = String::from(
            "SELECT id, description, collection_id, status, priority, tags, due_at, created_at, updated_at FROM tasks",
        );
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Value> = Vec::new();

        if let Some(collection_id) = filter.collection_id {
            clauses.push("collection_id = ?".to_string());
            args.push(Value::Text(collection_id.to_string()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?".to_string());
            args.push(Value::Text(status.as_str().to_string()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), task_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(hydrate_task(row?)?);
        }
        Ok(tasks)
    }

    fn update_task(&mut self, task: &mut Task) -> Result<()> {
        let existing = self
            .get_task(task.id)?
            .ok_or_else(|| StoreError::not_found("task", task.id))?;
        if task.collection_id != existing.collection_id {
            if let Some(collection_id) = task.collection_id {
                if !self.collection_exists(collection_id)? {
                    return Err(StoreError::missing_parent(
                        "task",
                        "collection",
                        collection_id,
                    ));
                }
            }
        }

        task.created_at = existing.created_at;
        task.updated_at = now_ms();

        self.conn.execute(
            "UPDATE tasks
             SET description = ?2, collection_id = ?3, status = ?4, priority = ?5, tags = ?6,
                 due_at = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                task.id.to_string(),
                task.description,
                task.collection_id.map(|id| id.to_string()),
                task.status.as_str(),
                task.priority.as_str(),
                serde_json::to_string(&task.tags)?,
                opt_ms(task.due_at),
                to_ms(task.updated_at),
            ],
        )?;
        Ok(())
    }

    fn delete_task(&mut self, id: Uuid) -> Result<()> {
        self.conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    // ==================== Saved Search Operations ====================

    fn save_search(&mut self, search: &mut SavedSearch) -> Result<()> {
        if search.id.is_nil() {
            search.id = Uuid::new_v4();
        }
        let now = now_ms();
        search.created_at = now;
        search.updated_at = now;

        self.conn.execute(
            r#"
            INSERT INTO saved_searches (id, name, query, tag, source, type, description, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(name) DO UPDATE SET
                query = excluded.query,
                tag = excluded.tag,
                source = excluded.source,
                type = excluded.type,
                description = excluded.description,
                updated_at = excluded.updated_at
            "#,
            params![
                search.id.to_string(),
                search.name,
                search.query,
                search.tag,
                search.source,
                search.doc_type,
                search.description,
                to_ms(search.created_at),
                to_ms(search.updated_at),
            ],
        )?;

        // On replace the stored row keeps its original id and
        // created_at; reflect that back to the caller
        if let Some(stored) = self.get_saved_search(&search.name)? {
            *search = stored;
        }
        Ok(())
    }

    fn get_saved_search(&self, id_or_name: &str) -> Result<Option<SavedSearch>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, query, tag, source, type, description, created_at, updated_at
                 FROM saved_searches WHERE id = ?1 OR name = ?1",
                params![id_or_name],
                search_row,
            )
            .optional()?;
        match row {
            Some(row) => Ok(Some(hydrate_search(row)?)),
            None => Ok(None),
        }
    }

    fn list_saved_searches(&self) -> Result<Vec<SavedSearch>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, query, tag, source, type, description, created_at, updated_at
             FROM saved_searches ORDER BY updated_at DESC, id ASC",
        )?;
        let rows = stmt.query_map([], search_row)?;

        let mut searches = Vec::new();
        for row in rows {
            searches.push(hydrate_search(row?)?);
        }
        Ok(searches)
    }

    fn delete_saved_search(&mut self, id: Uuid) -> Result<()> {
        self.conn.execute(
            "DELETE FROM saved_searches WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }
}

struct TaskRow {
    id: String,
    description: String,
    collection_id: Option<String>,
    status: String,
    priority: String,
    tags: String,
    due_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

fn task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        description: row.get(1)?,
        collection_id: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        tags: row.get(5)?,
        due_at: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn hydrate_task(row: TaskRow) -> Result<Task> {
    Ok(Task {
        id: Uuid::parse_str(&row.id)?,
        description: row.description,
        collection_id: row
            .collection_id
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()?,
        status: TaskStatus::parse(&row.status),
        priority: TaskPriority::parse(&row.priority),
        tags: serde_json::from_str(&row.tags).unwrap_or_default(),
        due_at: from_opt_ms(row.due_at),
        created_at: from_ms(row.created_at),
        updated_at: from_ms(row.updated_at),
    })
}

struct SearchRow {
    id: String,
    name: String,
    query: String,
    tag: Option<String>,
    source: Option<String>,
    doc_type: Option<String>,
    description: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn search_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SearchRow> {
    Ok(SearchRow {
        id: row.get(0)?,
        name: row.get(1)?,
        query: row.get(2)?,
        tag: row.get(3)?,
        source: row.get(4)?,
        doc_type: row.get(5)?,
        description: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn hydrate_search(row: SearchRow) -> Result<SavedSearch> {
    Ok(SavedSearch {
        id: Uuid::parse_str(&row.id)?,
        name: row.name,
        query: row.query,
        tag: row.tag,
        source: row.source,
        doc_type: row.doc_type,
        description: row.description,
        created_at: from_ms(row.created_at),
        updated_at: from_ms(row.updated_at),
    })
}
