//! Knowledge base types for retrieval-augmented SQL generation.
//!
//! Terms, examples, prompt fragments and articles share a retrieval
//! interface but diverge in scoring and prompt injection, so they are
//! modeled as a tagged union rather than one flat schema.

pub mod retriever;

pub use retriever::{EmbeddingStore, RetrievalBundle, Retriever, Scored};

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::answer::ChartKind;
use crate::db::Dialect;

/// A business phrase mapped to a physical field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    pub id: Uuid,
    /// Business phrase as users write it, e.g. "销售额".
    pub phrase: String,
    /// Physical field name the phrase resolves to, e.g. "amount".
    pub field: String,
    /// Optional table the mapping is scoped to.
    pub table: Option<String>,
    pub category: Option<String>,
}

/// A canonical question/SQL pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Example {
    pub id: Uuid,
    pub question: String,
    pub sql: String,
    /// Dialect the SQL was written for; None means any.
    pub dialect: Option<Dialect>,
    /// Table the example centers on, used as a retrieval hint.
    pub table: Option<String>,
    pub chart_kind: Option<ChartKind>,
}

/// A named reusable instruction fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptFragment {
    pub id: Uuid,
    pub name: String,
    pub body: String,
    pub kind: String,
    pub priority: i32,
}

/// A free-form titled article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
}

/// One knowledge base entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum KnowledgeItem {
    Term(Term),
    Example(Example),
    Prompt(PromptFragment),
    Article(Article),
}

impl KnowledgeItem {
    /// Identity of the wrapped entry.
    pub fn id(&self) -> Uuid {
        match self {
            Self::Term(t) => t.id,
            Self::Example(e) => e.id,
            Self::Prompt(p) => p.id,
            Self::Article(a) => a.id,
        }
    }

    /// Source kind tag for scoring and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Term(_) => "term",
            Self::Example(_) => "example",
            Self::Prompt(_) => "prompt",
            Self::Article(_) => "article",
        }
    }

    /// Text the lexical lane matches against.
    pub fn match_text(&self) -> String {
        match self {
            Self::Term(t) => format!("{} {}", t.phrase, t.field),
            Self::Example(e) => e.question.clone(),
            Self::Prompt(p) => p.name.clone(),
            Self::Article(a) => {
                let tags = a.tags.join(" ");
                format!("{} {}", a.title, tags)
            }
        }
    }
}

/// Read-mostly snapshot index over the knowledge base.
///
/// Requests read an immutable snapshot; knowledge CRUD swaps in a fresh one.
#[derive(Default)]
pub struct KnowledgeIndex {
    items: RwLock<Arc<Vec<KnowledgeItem>>>,
}

impl KnowledgeIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current immutable snapshot.
    pub fn snapshot(&self) -> Arc<Vec<KnowledgeItem>> {
        self.items.read().expect("knowledge index lock poisoned").clone()
    }

    /// Replaces the whole index. Called after knowledge writes.
    pub fn replace(&self, items: Vec<KnowledgeItem>) {
        *self.items.write().expect("knowledge index lock poisoned") = Arc::new(items);
    }
}
