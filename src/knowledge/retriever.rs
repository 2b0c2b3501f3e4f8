//! Hybrid knowledge retrieval.
//!
//! Two lanes over the knowledge index: a lexical lane (substring and token
//! matching with synonym expansion through the term index) and an optional
//! vector lane over an embeddings store. Lane rankings merge with
//! reciprocal-rank fusion; a missing or failing vector store degrades the
//! retriever to lexical-only without failing the request.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::db::Dialect;
use crate::error::Result;
use crate::knowledge::{Article, Example, KnowledgeIndex, KnowledgeItem, PromptFragment, Term};

/// RRF smoothing constant.
const RRF_K: f64 = 60.0;

/// Nearest-neighbor lookup over item embeddings.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Returns up to `k` (item id, similarity) pairs for the query text,
    /// most similar first.
    async fn top_k(&self, query: &str, k: usize) -> Result<Vec<(Uuid, f32)>>;
}

/// A retrieved item with its fused relevance score and source lane.
#[derive(Debug, Clone)]
pub struct Scored<T> {
    pub item: T,
    pub score: f64,
    /// "lexical", "vector" or "fused".
    pub source: &'static str,
}

/// Retrieval output in three typed lanes.
#[derive(Debug, Default)]
pub struct RetrievalBundle {
    pub terms: Vec<Scored<Term>>,
    pub examples: Vec<Scored<Example>>,
    pub articles: Vec<Scored<Article>>,
    /// True when the vector lane was configured but unavailable.
    pub degraded: bool,
}

impl RetrievalBundle {
    /// Returns true when nothing was retrieved.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.examples.is_empty() && self.articles.is_empty()
    }
}

/// Hybrid retriever over the knowledge index.
pub struct Retriever {
    index: Arc<KnowledgeIndex>,
    embeddings: Option<Arc<dyn EmbeddingStore>>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        index: Arc<KnowledgeIndex>,
        embeddings: Option<Arc<dyn EmbeddingStore>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embeddings,
            config,
        }
    }

    /// Retrieves terms, examples and articles relevant to the question.
    pub async fn retrieve(&self, question: &str, dialect: Dialect) -> RetrievalBundle {
        let items = self.index.snapshot();
        let query_tokens = tokenize(question);

        // Term pass first: matched terms expand the query so examples and
        // articles phrased in physical column names still surface.
        let mut expanded_tokens = query_tokens.clone();
        for item in items.iter() {
            if let KnowledgeItem::Term(term) = item {
                if lexical_score(question, &query_tokens, &item.match_text()) > 0.0 {
                    expanded_tokens.extend(tokenize(&term.field));
                    expanded_tokens.extend(tokenize(&term.phrase));
                }
            }
        }

        // Lexical lane over every item.
        let mut lexical: Vec<(Uuid, f64)> = items
            .iter()
            .filter_map(|item| {
                let score = lexical_score(question, &expanded_tokens, &item.match_text());
                (score > 0.0).then_some((item.id(), score))
            })
            .collect();
        lexical.sort_by(|a, b| b.1.total_cmp(&a.1));

        // Vector lane, when configured.
        let mut degraded = false;
        let vector: Vec<(Uuid, f32)> = match &self.embeddings {
            Some(store) => {
                let k = self.config.max_terms + self.config.max_examples + self.config.max_articles;
                match store.top_k(question, k).await {
                    Ok(hits) => hits,
                    Err(e) => {
                        warn!("Vector store unavailable, using lexical lane only: {e}");
                        degraded = true;
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        // Reciprocal-rank fusion across lanes.
        let mut fused: HashMap<Uuid, (f64, &'static str)> = HashMap::new();
        for (rank, (id, _)) in lexical.iter().enumerate() {
            let entry = fused.entry(*id).or_insert((0.0, "lexical"));
            entry.0 += 1.0 / (RRF_K + rank as f64 + 1.0);
        }
        for (rank, (id, _)) in vector.iter().enumerate() {
            let entry = fused.entry(*id).or_insert((0.0, "vector"));
            entry.0 += 1.0 / (RRF_K + rank as f64 + 1.0);
            if entry.1 == "lexical" {
                entry.1 = "fused";
            }
        }

        let mut bundle = RetrievalBundle {
            degraded,
            ..Default::default()
        };

        let mut ranked: Vec<(&KnowledgeItem, f64, &'static str)> = items
            .iter()
            .filter_map(|item| {
                fused
                    .get(&item.id())
                    .map(|(score, source)| (item, *score, *source))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        for (item, score, source) in ranked {
            match item {
                KnowledgeItem::Term(term) => {
                    if bundle.terms.len() < self.config.max_terms {
                        bundle.terms.push(Scored {
                            item: term.clone(),
                            score,
                            source,
                        });
                    }
                }
                KnowledgeItem::Example(example) => {
                    let dialect_ok =
                        example.dialect.is_none() || example.dialect == Some(dialect);
                    if dialect_ok && bundle.examples.len() < self.config.max_examples {
                        bundle.examples.push(Scored {
                            item: example.clone(),
                            score,
                            source,
                        });
                    }
                }
                KnowledgeItem::Article(article) => {
                    if bundle.articles.len() < self.config.max_articles {
                        bundle.articles.push(Scored {
                            item: article.clone(),
                            score,
                            source,
                        });
                    }
                }
                KnowledgeItem::Prompt(_) => {}
            }
        }

        self.apply_token_budget(&mut bundle);
        bundle
    }

    /// Returns active prompt fragments, highest priority first. These feed
    /// the composer's system section.
    pub fn prompt_fragments(&self) -> Vec<PromptFragment> {
        let items = self.index.snapshot();
        let mut prompts: Vec<PromptFragment> = items
            .iter()
            .filter_map(|item| match item {
                KnowledgeItem::Prompt(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        prompts.sort_by_key(|p| std::cmp::Reverse(p.priority));
        prompts
    }

    /// Up to `k` near-neighbor example questions, for follow-up suggestions.
    pub async fn recommend_questions(&self, question: &str, k: usize) -> Vec<String> {
        let items = self.index.snapshot();
        let tokens = tokenize(question);

        let mut scored: Vec<(f64, &str)> = items
            .iter()
            .filter_map(|item| match item {
                KnowledgeItem::Example(example) if example.question != question => {
                    let score = lexical_score(question, &tokens, &example.question);
                    (score > 0.0).then_some((score, example.question.as_str()))
                }
                _ => None,
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored
            .into_iter()
            .take(k)
            .map(|(_, q)| q.to_string())
            .collect()
    }

    /// Global cap: drop items beyond the token budget, articles first.
    fn apply_token_budget(&self, bundle: &mut RetrievalBundle) {
        let budget = self.config.token_budget;
        let mut used = 0usize;

        let mut admit = |cost: usize| {
            if used + cost <= budget {
                used += cost;
                true
            } else {
                false
            }
        };

        bundle
            .terms
            .retain(|s| admit(estimate_tokens(&s.item.phrase) + estimate_tokens(&s.item.field)));
        bundle
            .examples
            .retain(|s| admit(estimate_tokens(&s.item.question) + estimate_tokens(&s.item.sql)));
        bundle
            .articles
            .retain(|s| admit(estimate_tokens(&s.item.title) + estimate_tokens(&s.item.body)));
    }
}

/// Conservative token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Lowercased tokens. ASCII runs split on non-alphanumerics; CJK text
/// contributes single characters and bigrams so substring-ish matching
/// works without a segmenter.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut ascii_run = String::new();
    let mut prev_cjk: Option<char> = None;

    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            ascii_run.push(c.to_ascii_lowercase());
            prev_cjk = None;
        } else {
            if !ascii_run.is_empty() {
                tokens.push(std::mem::take(&mut ascii_run));
            }
            if is_cjk(c) {
                tokens.push(c.to_string());
                if let Some(prev) = prev_cjk {
                    tokens.push(format!("{prev}{c}"));
                }
                prev_cjk = Some(c);
            } else {
                prev_cjk = None;
            }
        }
    }
    if !ascii_run.is_empty() {
        tokens.push(ascii_run);
    }

    tokens
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF)
}

/// Case-insensitive relevance of `text` to the query: a strong bonus for a
/// substring hit in either direction plus the token-overlap ratio.
fn lexical_score(question: &str, query_tokens: &[String], text: &str) -> f64 {
    let question_lower = question.to_lowercase();
    let text_lower = text.to_lowercase();

    let mut score = 0.0;
    if !text_lower.is_empty()
        && (question_lower.contains(&text_lower) || text_lower.contains(&question_lower))
    {
        score += 2.0;
    }

    let text_tokens = tokenize(&text_lower);
    if text_tokens.is_empty() || query_tokens.is_empty() {
        return score;
    }

    let hits = text_tokens
        .iter()
        .filter(|t| query_tokens.contains(t))
        .count();
    score + hits as f64 / text_tokens.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::ChartKind;
    use crate::error::AskError;

    fn term(phrase: &str, field: &str) -> KnowledgeItem {
        KnowledgeItem::Term(Term {
            id: Uuid::new_v4(),
            phrase: phrase.into(),
            field: field.into(),
            table: Some("orders".into()),
            category: None,
        })
    }

    fn example(question: &str, sql: &str, dialect: Option<Dialect>) -> KnowledgeItem {
        KnowledgeItem::Example(Example {
            id: Uuid::new_v4(),
            question: question.into(),
            sql: sql.into(),
            dialect,
            table: Some("orders".into()),
            chart_kind: Some(ChartKind::Bar),
        })
    }

    fn article(title: &str, body: &str) -> KnowledgeItem {
        KnowledgeItem::Article(Article {
            id: Uuid::new_v4(),
            title: title.into(),
            body: body.into(),
            category: None,
            tags: vec![],
        })
    }

    fn retriever_with(items: Vec<KnowledgeItem>) -> Retriever {
        let index = Arc::new(KnowledgeIndex::new());
        index.replace(items);
        Retriever::new(index, None, RetrievalConfig::default())
    }

    #[test]
    fn test_tokenize_mixed_text() {
        let tokens = tokenize("本月 sales by region");
        assert!(tokens.contains(&"本".to_string()));
        assert!(tokens.contains(&"本月".to_string()));
        assert!(tokens.contains(&"sales".to_string()));
        assert!(tokens.contains(&"region".to_string()));
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[tokio::test]
    async fn test_term_matched_by_substring() {
        let retriever = retriever_with(vec![
            term("销售额", "amount"),
            term("客单价", "avg_order_value"),
        ]);

        let bundle = retriever.retrieve("本月各地区销售额前五", Dialect::MySql).await;
        assert_eq!(bundle.terms.len(), 1);
        assert_eq!(bundle.terms[0].item.field, "amount");
        assert!(!bundle.degraded);
    }

    #[tokio::test]
    async fn test_synonym_expansion_pulls_examples() {
        // The question says 销售额; the example is phrased with "amount".
        // The term mapping bridges the two.
        let retriever = retriever_with(vec![
            term("销售额", "amount"),
            example(
                "top regions by amount",
                "SELECT region, SUM(amount) FROM orders GROUP BY region ORDER BY SUM(amount) DESC LIMIT 5",
                Some(Dialect::MySql),
            ),
        ]);

        let bundle = retriever.retrieve("各地区销售额前五", Dialect::MySql).await;
        assert_eq!(bundle.examples.len(), 1);
    }

    #[tokio::test]
    async fn test_examples_dialect_filtered() {
        let retriever = retriever_with(vec![
            example("count orders", "SELECT COUNT(*) FROM orders", Some(Dialect::Oracle)),
            example("count orders", "SELECT COUNT(*) FROM orders", Some(Dialect::MySql)),
            example("count orders", "SELECT COUNT(*) FROM orders", None),
        ]);

        let bundle = retriever.retrieve("count orders", Dialect::MySql).await;
        assert_eq!(bundle.examples.len(), 2);
        for scored in &bundle.examples {
            assert_ne!(scored.item.dialect, Some(Dialect::Oracle));
        }
    }

    #[tokio::test]
    async fn test_lane_caps_respected() {
        let items: Vec<KnowledgeItem> = (0..30)
            .map(|i| term(&format!("orders metric {i}"), &format!("col_{i}")))
            .collect();
        let retriever = retriever_with(items);

        let bundle = retriever.retrieve("orders metric", Dialect::MySql).await;
        assert!(bundle.terms.len() <= RetrievalConfig::default().max_terms);
    }

    #[tokio::test]
    async fn test_token_budget_drops_articles_first() {
        let index = Arc::new(KnowledgeIndex::new());
        index.replace(vec![
            term("orders total", "amount"),
            article("orders glossary", &"long body ".repeat(4000)),
        ]);
        let retriever = Retriever::new(
            index,
            None,
            RetrievalConfig {
                token_budget: 50,
                ..Default::default()
            },
        );

        let bundle = retriever.retrieve("orders total", Dialect::MySql).await;
        assert!(!bundle.terms.is_empty());
        assert!(bundle.articles.is_empty());
    }

    #[tokio::test]
    async fn test_unrelated_items_not_retrieved() {
        let retriever = retriever_with(vec![term("发货周期", "shipping_days")]);
        let bundle = retriever.retrieve("monthly revenue", Dialect::MySql).await;
        assert!(bundle.is_empty());
    }

    struct FailingStore;

    #[async_trait]
    impl EmbeddingStore for FailingStore {
        async fn top_k(&self, _query: &str, _k: usize) -> Result<Vec<(Uuid, f32)>> {
            Err(AskError::internal("vector store offline"))
        }
    }

    struct FixedStore {
        hits: Vec<(Uuid, f32)>,
    }

    #[async_trait]
    impl EmbeddingStore for FixedStore {
        async fn top_k(&self, _query: &str, _k: usize) -> Result<Vec<(Uuid, f32)>> {
            Ok(self.hits.clone())
        }
    }

    #[tokio::test]
    async fn test_vector_failure_degrades_to_lexical() {
        let index = Arc::new(KnowledgeIndex::new());
        index.replace(vec![term("销售额", "amount")]);
        let retriever = Retriever::new(
            index,
            Some(Arc::new(FailingStore)),
            RetrievalConfig::default(),
        );

        let bundle = retriever.retrieve("销售额", Dialect::MySql).await;
        assert!(bundle.degraded);
        assert_eq!(bundle.terms.len(), 1);
    }

    #[tokio::test]
    async fn test_vector_lane_surfaces_lexical_misses() {
        let vector_only = Example {
            id: Uuid::new_v4(),
            question: "营收排名".into(),
            sql: "SELECT region, SUM(amount) FROM orders GROUP BY region".into(),
            dialect: None,
            table: None,
            chart_kind: None,
        };
        let index = Arc::new(KnowledgeIndex::new());
        index.replace(vec![KnowledgeItem::Example(vector_only.clone())]);

        let retriever = Retriever::new(
            index,
            Some(Arc::new(FixedStore {
                hits: vec![(vector_only.id, 0.93)],
            })),
            RetrievalConfig::default(),
        );

        let bundle = retriever.retrieve("revenue ranking", Dialect::MySql).await;
        assert_eq!(bundle.examples.len(), 1);
        assert_eq!(bundle.examples[0].source, "vector");
    }

    #[tokio::test]
    async fn test_recommend_questions() {
        let retriever = retriever_with(vec![
            example("top regions by sales", "SELECT 1", None),
            example("monthly sales trend", "SELECT 2", None),
            example("inventory aging", "SELECT 3", None),
        ]);

        let recs = retriever.recommend_questions("sales by region", 5).await;
        assert!(!recs.is_empty());
        assert!(recs.len() <= 5);
        assert!(recs.iter().any(|q| q.contains("sales")));
        assert!(!recs.iter().any(|q| q == "sales by region"));
    }

    #[tokio::test]
    async fn test_prompt_fragments_sorted_by_priority() {
        let retriever = retriever_with(vec![
            KnowledgeItem::Prompt(PromptFragment {
                id: Uuid::new_v4(),
                name: "low".into(),
                body: "".into(),
                kind: "style".into(),
                priority: 1,
            }),
            KnowledgeItem::Prompt(PromptFragment {
                id: Uuid::new_v4(),
                name: "high".into(),
                body: "".into(),
                kind: "style".into(),
                priority: 9,
            }),
        ]);

        let prompts = retriever.prompt_fragments();
        assert_eq!(prompts[0].name, "high");
        assert_eq!(prompts[1].name, "low");
    }
}
