//! Lectern Core Library
//!
//! This crate provides the persistence core for Lectern, a personal
//! library manager for documents, annotations, reading sessions, and
//! spaced repetition flashcards.
//!
//! # Architecture
//!
//! - **One contract, three engines**: every operation goes through the
//!   [`LibraryStore`] trait, implemented by a relational SQLite engine
//!   (full-text search, tasks, saved searches), a durable sled
//!   key-value engine, and a volatile in-memory engine.
//!
//! The engine is chosen at runtime from configuration; callers hold a
//! `Box<dyn LibraryStore>` and never branch on the backend.
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let mut store = open_store(&config)?;
//!
//! // Add a document
//! let mut doc = Document::new("Attention Is All You Need", DocumentType::Paper);
//! store.add_document(&mut doc)?;
//!
//! // Make a flashcard from it and review it
//! let mut card = Flashcard::new("Who introduced the transformer?", "Vaswani et al.");
//! card.document_id = Some(doc.id);
//! store.add_flashcard(&mut card)?;
//! store.review_flashcard(card.id, 4)?;
//! ```
//!
//! # Modules
//!
//! - `store`: the storage contract and backend selection (main entry point)
//! - `models`: data structures for documents, collections, annotations,
//!   sessions, flashcards, tasks, and saved searches
//! - `sqlite`: relational engine with FTS5 full-text search
//! - `kv`: key-value engines (durable sled and volatile in-memory)
//! - `scheduler`: SM-2 spaced repetition scheduling
//! - `metadata`: collaborator traits for metadata lookup and text extraction
//! - `config`: application configuration
//! - `error`: the storage error type

pub mod config;
pub mod error;
pub mod kv;
pub mod metadata;
pub mod models;
pub mod scheduler;
pub mod sqlite;
pub mod store;

pub use config::Config;
pub use error::{Result, StoreError};
pub use kv::backend::{KeyValue, MemoryKv, SledKv};
pub use kv::{KvStore, MemoryStore, SledStore};
pub use metadata::{DocumentMetadata, MetadataResolver, TextExtractor};
pub use models::{
    Annotation, AnnotationType, Collection, Document, DocumentType, Flashcard, FlashcardReview,
    FlashcardType, ReadingSession, ReadingStatus, SavedSearch, Task, TaskPriority, TaskStatus,
};
pub use scheduler::{next_schedule, Quality, Schedule, INITIAL_EASE, MAX_EASE, MIN_EASE};
pub use sqlite::SqliteStore;
pub use store::{open_store, Backend, DocumentFilter, FlashcardFilter, LibraryStore, TaskFilter};
