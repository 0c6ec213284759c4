//! Data models for the library
//!
//! Defines the persisted entities: Document, Collection, Annotation,
//! ReadingSession, Flashcard, FlashcardReview, Task, and SavedSearch.
//! All timestamps are kept at millisecond precision so that orderings
//! observed through different storage backends agree.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::scheduler::INITIAL_EASE;

/// Current time truncated to millisecond precision
///
/// Storage backends persist timestamps as integer milliseconds, so
/// in-memory values carry the same precision from the start.
pub(crate) fn now_ms() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// The kind of content a document holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    /// arXiv, conference, or journal paper
    Paper,
    /// Textbook or monograph
    Book,
    /// Web article or blog post
    Article,
    /// Lecture or tutorial recording
    Video,
    /// User-created note
    Note,
    /// Git repository
    Repo,
    #[default]
    Other,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Paper => "paper",
            DocumentType::Book => "book",
            DocumentType::Article => "article",
            DocumentType::Video => "video",
            DocumentType::Note => "note",
            DocumentType::Repo => "repo",
            DocumentType::Other => "other",
        }
    }

    /// Parse the stored string form; unknown values map to `Other`
    pub fn parse(s: &str) -> Self {
        match s {
            "paper" => DocumentType::Paper,
            "book" => DocumentType::Book,
            "article" => DocumentType::Article,
            "video" => DocumentType::Video,
            "note" => DocumentType::Note,
            "repo" => DocumentType::Repo,
            _ => DocumentType::Other,
        }
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reading progress of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingStatus {
    #[default]
    Unread,
    Reading,
    Completed,
    Archived,
}

impl ReadingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::Unread => "unread",
            ReadingStatus::Reading => "reading",
            ReadingStatus::Completed => "completed",
            ReadingStatus::Archived => "archived",
        }
    }

    /// Parse the stored string form; unknown values map to `Unread`
    pub fn parse(s: &str) -> Self {
        match s {
            "reading" => ReadingStatus::Reading,
            "completed" => ReadingStatus::Completed,
            "archived" => ReadingStatus::Archived,
            _ => ReadingStatus::Unread,
        }
    }
}

impl std::fmt::Display for ReadingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any item in the library: paper, book, article, video, note, repo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier
    pub id: Uuid,
    /// Kind of content
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    /// Local file or directory; unique when present (import dedup key)
    pub path: Option<String>,
    /// Where the document came from ("arxiv", "doi", "url", "local", ...)
    pub source: Option<String>,
    /// Identifier within the source, e.g. an arXiv ID or DOI
    pub source_id: Option<String>,
    /// Display title
    pub title: String,
    /// Author names, in citation order
    pub authors: Vec<String>,
    /// Abstract or summary
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    /// Extracted full text (optional, can be large)
    pub full_text: String,
    /// Tags for organization
    pub tags: Vec<String>,
    /// Free-form user notes
    pub notes: String,
    /// Personal rating, 1-5
    pub rating: Option<u8>,
    /// Reading progress
    pub status: ReadingStatus,
    /// When the document was finished
    pub read_at: Option<DateTime<Utc>>,
    /// Type-specific metadata (unstructured)
    pub meta: Map<String, Value>,
    /// When this document was created
    pub created_at: DateTime<Utc>,
    /// When this document was last updated
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create a new document with the given title and type
    pub fn new(title: impl Into<String>, doc_type: DocumentType) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            doc_type,
            path: None,
            source: None,
            source_id: None,
            title: title.into(),
            authors: Vec::new(),
            abstract_text: String::new(),
            full_text: String::new(),
            tags: Vec::new(),
            notes: String::new(),
            rating: None,
            status: ReadingStatus::default(),
            read_at: None,
            meta: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the title
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.touch();
    }

    /// Update the reading status
    ///
    /// Stamps `read_at` the first time the document is marked completed.
    pub fn set_status(&mut self, status: ReadingStatus) {
        if status == ReadingStatus::Completed && self.read_at.is_none() {
            self.read_at = Some(now_ms());
        }
        self.status = status;
        self.touch();
    }

    /// Set the personal rating (1-5)
    pub fn set_rating(&mut self, rating: Option<u8>) {
        self.rating = rating;
        self.touch();
    }

    /// Set the local path
    pub fn set_path(&mut self, path: Option<String>) {
        self.path = path;
        self.touch();
    }

    /// Set the source and source ID pair
    pub fn set_source(&mut self, source: Option<String>, source_id: Option<String>) {
        self.source = source;
        self.source_id = source_id;
        self.touch();
    }

    /// Update the user notes
    pub fn set_notes(&mut self, notes: impl Into<String>) {
        self.notes = notes.into();
        self.touch();
    }

    /// Store the extracted full text
    pub fn set_full_text(&mut self, text: impl Into<String>) {
        self.full_text = text.into();
        self.touch();
    }

    /// Add a tag
    ///
    /// Comparison is case-insensitive; adding "ML" when "ml" is present
    /// is a no-op.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
            self.tags.push(tag);
            self.touch();
        }
    }

    /// Remove a tag (case-insensitive)
    pub fn remove_tag(&mut self, tag: &str) {
        let before = self.tags.len();
        self.tags.retain(|t| !t.eq_ignore_ascii_case(tag));
        if self.tags.len() != before {
            self.touch();
        }
    }

    /// Set all tags (replacing existing)
    pub fn set_tags(&mut self, tags: Vec<String>) {
        self.tags = tags;
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

/// A named group of documents
///
/// Membership is many-to-many: a document can belong to several
/// collections, and deleting a collection leaves its members intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: Uuid,
    /// Unique name (case-insensitive)
    pub name: String,
    pub description: String,
    /// Member documents, insertion-ordered, no duplicates
    pub document_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Collection {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            document_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a document to the membership list
    ///
    /// Returns false if the document is already a member.
    pub fn add_document(&mut self, id: Uuid) -> bool {
        if self.document_ids.contains(&id) {
            return false;
        }
        self.document_ids.push(id);
        self.updated_at = now_ms();
        true
    }

    /// Remove a document from the membership list
    ///
    /// Returns false if the document was not a member.
    pub fn remove_document(&mut self, id: Uuid) -> bool {
        let before = self.document_ids.len();
        self.document_ids.retain(|d| *d != id);
        if self.document_ids.len() == before {
            return false;
        }
        self.updated_at = now_ms();
        true
    }
}

/// The kind of annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationType {
    #[default]
    Note,
    Highlight,
    Bookmark,
}

impl AnnotationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationType::Note => "note",
            AnnotationType::Highlight => "highlight",
            AnnotationType::Bookmark => "bookmark",
        }
    }

    /// Parse the stored string form; unknown values map to `Note`
    pub fn parse(s: &str) -> Self {
        match s {
            "highlight" => AnnotationType::Highlight,
            "bookmark" => AnnotationType::Bookmark,
            _ => AnnotationType::Note,
        }
    }
}

/// A highlight, note, or bookmark on a specific part of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: Uuid,
    /// The document this annotation belongs to
    pub document_id: Uuid,
    #[serde(rename = "type")]
    pub annotation_type: AnnotationType,
    pub content: String,
    pub page: Option<u32>,
    /// Position within the page, as serialized coordinates
    pub position: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
}

impl Annotation {
    pub fn new(document_id: Uuid, annotation_type: AnnotationType, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            annotation_type,
            content: content.into(),
            page: None,
            position: String::new(),
            color: String::new(),
            created_at: now_ms(),
        }
    }
}

/// Time spent reading a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingSession {
    pub id: Uuid,
    pub document_id: Uuid,
    pub start_at: DateTime<Utc>,
    /// Unset while the session is still open
    pub end_at: Option<DateTime<Utc>>,
    pub pages_read: u32,
    pub notes: String,
}

impl ReadingSession {
    pub fn new(document_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            start_at: now_ms(),
            end_at: None,
            pages_read: 0,
            notes: String::new(),
        }
    }
}

/// The kind of flashcard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashcardType {
    #[default]
    Basic,
    Cloze,
}

impl FlashcardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlashcardType::Basic => "basic",
            FlashcardType::Cloze => "cloze",
        }
    }

    /// Parse the stored string form; unknown values map to `Basic`
    pub fn parse(s: &str) -> Self {
        match s {
            "cloze" => FlashcardType::Cloze,
            _ => FlashcardType::Basic,
        }
    }
}

/// A spaced repetition card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flashcard {
    pub id: Uuid,
    /// The document this card was made from, if any
    pub document_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub card_type: FlashcardType,
    pub front: String,
    pub back: String,
    /// Cloze deletion pattern: {{c1::text}}
    pub cloze: String,
    pub tags: Vec<String>,
    /// When this card is next due for review
    pub due_at: DateTime<Utc>,
    /// Days until the next review
    pub interval: u32,
    /// SM-2 ease factor, 1.3-2.5
    pub ease: f64,
    pub last_review: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flashcard {
    /// Create a basic front/back card, due immediately
    pub fn new(front: impl Into<String>, back: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            document_id: None,
            card_type: FlashcardType::Basic,
            front: front.into(),
            back: back.into(),
            cloze: String::new(),
            tags: Vec::new(),
            due_at: now,
            interval: 0,
            ease: INITIAL_EASE,
            last_review: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a cloze deletion card, due immediately
    pub fn new_cloze(text: impl Into<String>) -> Self {
        let mut card = Self::new("", "");
        card.card_type = FlashcardType::Cloze;
        card.cloze = text.into();
        card
    }

    /// Attach this card to a document
    pub fn set_document(&mut self, document_id: Option<Uuid>) {
        self.document_id = document_id;
        self.touch();
    }

    /// Add a tag (case-insensitive dedupe)
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
            self.tags.push(tag);
            self.touch();
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

/// A single review attempt, appended for audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashcardReview {
    pub id: Uuid,
    pub flashcard_id: Uuid,
    /// SM-2 quality score, 0-5
    pub quality: u8,
    pub reviewed_at: DateTime<Utc>,
    /// Interval before this review was applied
    pub prev_interval: u32,
    /// Ease before this review was applied
    pub prev_ease: f64,
}

/// Task completion state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Todo,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Done => "done",
        }
    }

    /// Parse the stored string form; unknown values map to `Todo`
    pub fn parse(s: &str) -> Self {
        match s {
            "done" => TaskStatus::Done,
            _ => TaskStatus::Todo,
        }
    }
}

/// Task urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
        }
    }

    /// Parse the stored string form; unknown values map to `Medium`
    pub fn parse(s: &str) -> Self {
        match s {
            "low" => TaskPriority::Low,
            "high" => TaskPriority::High,
            _ => TaskPriority::Medium,
        }
    }
}

/// A to-do item, optionally attached to a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub collection_id: Option<Uuid>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub tags: Vec<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            collection_id: None,
            status: TaskStatus::default(),
            priority: TaskPriority::default(),
            tags: Vec::new(),
            due_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark the task complete
    pub fn complete(&mut self) {
        self.status = TaskStatus::Done;
        self.updated_at = now_ms();
    }
}

/// A reusable named query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSearch {
    pub id: Uuid,
    /// Unique name; saving under an existing name replaces the search
    pub name: String,
    pub query: String,
    pub tag: Option<String>,
    pub source: Option<String>,
    pub doc_type: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SavedSearch {
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            query: query.into(),
            tag: None,
            source: None,
            doc_type: None,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }
}
