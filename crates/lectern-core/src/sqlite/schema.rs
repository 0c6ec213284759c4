//! SQLite schema for the relational engine
//!
//! Timestamps are stored as integer milliseconds so ordering matches
//! the in-memory models exactly. JSON-valued columns (authors, tags,
//! meta) hold serialized arrays and objects. Foreign keys carry
//! `ON DELETE CASCADE` so removing a document takes its annotations,
//! sessions, flashcards, and review history with it.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Library documents
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL DEFAULT 'other',
            path TEXT UNIQUE,
            source TEXT,
            source_id TEXT,
            title TEXT NOT NULL,
            authors TEXT NOT NULL DEFAULT '[]',
            abstract TEXT NOT NULL DEFAULT '',
            full_text TEXT NOT NULL DEFAULT '',
            tags TEXT NOT NULL DEFAULT '[]',
            notes TEXT NOT NULL DEFAULT '',
            rating INTEGER,
            status TEXT NOT NULL DEFAULT 'unread',
            read_at INTEGER,
            meta TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Named document groups
        CREATE TABLE IF NOT EXISTS collections (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL COLLATE NOCASE UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Collection membership (insertion-ordered via position)
        CREATE TABLE IF NOT EXISTS collection_documents (
            collection_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            added_at INTEGER NOT NULL,
            PRIMARY KEY (collection_id, document_id),
            FOREIGN KEY (collection_id) REFERENCES collections(id) ON DELETE CASCADE,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        -- Highlights, notes, and bookmarks on documents
        CREATE TABLE IF NOT EXISTS annotations (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            type TEXT NOT NULL DEFAULT 'note',
            content TEXT NOT NULL DEFAULT '',
            page INTEGER,
            position TEXT NOT NULL DEFAULT '',
            color TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        -- Reading time tracking
        CREATE TABLE IF NOT EXISTS reading_sessions (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            start_at INTEGER NOT NULL,
            end_at INTEGER,
            pages_read INTEGER NOT NULL DEFAULT 0,
            notes TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        -- Spaced repetition cards
        CREATE TABLE IF NOT EXISTS flashcards (
            id TEXT PRIMARY KEY,
            document_id TEXT,
            type TEXT NOT NULL DEFAULT 'basic',
            front TEXT NOT NULL DEFAULT '',
            back TEXT NOT NULL DEFAULT '',
            cloze TEXT NOT NULL DEFAULT '',
            tags TEXT NOT NULL DEFAULT '[]',
            due_at INTEGER NOT NULL,
            interval INTEGER NOT NULL DEFAULT 0,
            ease REAL NOT NULL DEFAULT 2.5,
            last_review INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        -- Review history (append-only)
        CREATE TABLE IF NOT EXISTS flashcard_reviews (
            id TEXT PRIMARY KEY,
            flashcard_id TEXT NOT NULL,
            quality INTEGER NOT NULL,
            reviewed_at INTEGER NOT NULL,
            prev_interval INTEGER NOT NULL,
            prev_ease REAL NOT NULL,
            FOREIGN KEY (flashcard_id) REFERENCES flashcards(id) ON DELETE CASCADE
        );

        -- Reading tasks
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            description TEXT NOT NULL,
            collection_id TEXT,
            status TEXT NOT NULL DEFAULT 'todo',
            priority TEXT NOT NULL DEFAULT 'medium',
            tags TEXT NOT NULL DEFAULT '[]',
            due_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (collection_id) REFERENCES collections(id) ON DELETE SET NULL
        );

        -- Saved searches
        CREATE TABLE IF NOT EXISTS saved_searches (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            query TEXT NOT NULL DEFAULT '',
            tag TEXT,
            source TEXT,
            type TEXT,
            description TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Indexes for common lookups
        CREATE INDEX IF NOT EXISTS idx_documents_updated ON documents(updated_at DESC);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_source
            ON documents(source, source_id)
            WHERE source IS NOT NULL AND source_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_annotations_document ON annotations(document_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_document ON reading_sessions(document_id);
        CREATE INDEX IF NOT EXISTS idx_flashcards_document ON flashcards(document_id);
        CREATE INDEX IF NOT EXISTS idx_flashcards_due ON flashcards(due_at);
        CREATE INDEX IF NOT EXISTS idx_reviews_flashcard ON flashcard_reviews(flashcard_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_collection ON tasks(collection_id);

        -- Full-text search over document content (porter stemming)
        CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
            title,
            abstract,
            notes,
            full_text,
            content='documents',
            content_rowid='rowid',
            tokenize='porter'
        );

        -- Triggers to keep FTS in sync with the documents table
        CREATE TRIGGER IF NOT EXISTS documents_ai AFTER INSERT ON documents BEGIN
            INSERT INTO documents_fts(rowid, title, abstract, notes, full_text)
            VALUES (NEW.rowid, NEW.title, NEW.abstract, NEW.notes, NEW.full_text);
        END;

        CREATE TRIGGER IF NOT EXISTS documents_ad AFTER DELETE ON documents BEGIN
            INSERT INTO documents_fts(documents_fts, rowid, title, abstract, notes, full_text)
            VALUES ('delete', OLD.rowid, OLD.title, OLD.abstract, OLD.notes, OLD.full_text);
        END;

        CREATE TRIGGER IF NOT EXISTS documents_au AFTER UPDATE ON documents BEGIN
            INSERT INTO documents_fts(documents_fts, rowid, title, abstract, notes, full_text)
            VALUES ('delete', OLD.rowid, OLD.title, OLD.abstract, OLD.notes, OLD.full_text);
            INSERT INTO documents_fts(rowid, title, abstract, notes, full_text)
            VALUES (NEW.rowid, NEW.title, NEW.abstract, NEW.notes, NEW.full_text);
        END;
        "#,
    )?;

    // Set schema version
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    // Check if schema_info table exists
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
