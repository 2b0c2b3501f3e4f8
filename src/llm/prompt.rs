//! Prompt composition.
//!
//! Builds the provider-agnostic message list from schema, retrieval and
//! history. Token accounting uses the conservative chars/4 estimator;
//! sections drop in reverse priority (articles, then history, then
//! examples, then terms) until the model's budget fits. Schema and the
//! system instruction never drop.

use crate::db::{schema::format_for_prompt, Dialect, TableSchema};
use crate::knowledge::retriever::estimate_tokens;
use crate::knowledge::{PromptFragment, RetrievalBundle};
use crate::llm::Message;

/// One prior turn carried into the prompt: the user's question and the SQL
/// the assistant answered with. Raw result rows never travel back.
#[derive(Debug, Clone)]
pub struct HistoryTurn {
    pub question: String,
    pub sql: Option<String>,
}

/// Everything the composer needs for one turn.
pub struct PromptInputs<'a> {
    pub dialect: Dialect,
    pub schemas: &'a [TableSchema],
    pub bundle: &'a RetrievalBundle,
    pub fragments: &'a [PromptFragment],
    pub history: &'a [HistoryTurn],
    pub question: &'a str,
    pub token_budget: usize,
}

/// What the composer produced besides the messages.
#[derive(Debug, Default)]
pub struct PromptStats {
    pub estimated_tokens: usize,
    /// Sections dropped to fit the budget, in drop order.
    pub dropped: Vec<&'static str>,
}

/// Composes the message list for one turn.
pub fn compose(inputs: &PromptInputs<'_>) -> (Vec<Message>, PromptStats) {
    let system_head = system_instruction(inputs.dialect, inputs.fragments);
    let schema_block = format!("DATABASE SCHEMA:\n{}", format_for_prompt(inputs.schemas));
    let contract = output_contract();

    let mut terms = term_glossary(inputs.bundle);
    let mut examples = example_block(inputs.bundle);
    let mut articles = article_block(inputs.bundle);
    let mut history: Vec<HistoryTurn> = inputs.history.to_vec();

    let fixed_cost = estimate_tokens(&system_head)
        + estimate_tokens(&schema_block)
        + estimate_tokens(&contract)
        + estimate_tokens(inputs.question);

    let mut stats = PromptStats::default();
    let budget = inputs.token_budget;

    let over = |terms: &str, examples: &str, articles: &str, history: &[HistoryTurn]| {
        fixed_cost
            + estimate_tokens(terms)
            + estimate_tokens(examples)
            + estimate_tokens(articles)
            + history_tokens(history)
            > budget
    };

    if over(&terms, &examples, &articles, &history) && !articles.is_empty() {
        articles.clear();
        stats.dropped.push("articles");
    }
    while over(&terms, &examples, &articles, &history) && !history.is_empty() {
        // Oldest turns go first.
        history.remove(0);
        if !stats.dropped.contains(&"history") {
            stats.dropped.push("history");
        }
    }
    if over(&terms, &examples, &articles, &history) && !examples.is_empty() {
        examples.clear();
        stats.dropped.push("examples");
    }
    if over(&terms, &examples, &articles, &history) && !terms.is_empty() {
        terms.clear();
        stats.dropped.push("terms");
    }

    let mut system = system_head;
    system.push_str("\n\n");
    system.push_str(&schema_block);
    for section in [&terms, &examples, &articles] {
        if !section.is_empty() {
            system.push_str("\n\n");
            system.push_str(section);
        }
    }
    system.push_str("\n\n");
    system.push_str(&contract);

    let mut messages = Vec::with_capacity(2 + history.len() * 2);
    messages.push(Message::system(system));
    for turn in &history {
        messages.push(Message::user(turn.question.clone()));
        let reply = match &turn.sql {
            Some(sql) => format!("```sql\n{sql}\n```"),
            None => "(no SQL was produced)".to_string(),
        };
        messages.push(Message::assistant(reply));
    }
    messages.push(Message::user(inputs.question.to_string()));

    stats.estimated_tokens = messages
        .iter()
        .map(|m| estimate_tokens(&m.content))
        .sum();

    (messages, stats)
}

fn system_instruction(dialect: Dialect, fragments: &[PromptFragment]) -> String {
    let quoted = dialect.quote_ident("column_name");
    let mut text = format!(
        "You are a SQL assistant answering data questions against a {dialect} database.\n\
         \n\
         RULES:\n\
         - Generate exactly one read-only statement: SELECT, or WITH ending in a SELECT\n\
         - Never generate INSERT, UPDATE, DELETE, DDL or any statement that changes data\n\
         - Quote identifiers that need it in the {dialect} style, e.g. {quoted}\n\
         - Use named parameters like :customer_name for user-supplied string values and \
           return their values in the params object\n\
         - Only reference tables from the schema below; if a table is marked \
           \"table not found\", say so instead of guessing"
    );

    for fragment in fragments {
        text.push_str("\n- ");
        text.push_str(fragment.body.trim());
    }

    text
}

fn output_contract() -> String {
    "OUTPUT FORMAT:\n\
     Reply with a single fenced JSON object:\n\
     ```json\n\
     {\"sql\": \"...\", \"explanation\": \"...\", \"chartKind\": \"table|bar|line|pie|scatter|area\", \
      \"complex\": false, \"params\": {}}\n\
     ```\n\
     Only fenced JSON is parsed."
        .to_string()
}

fn term_glossary(bundle: &RetrievalBundle) -> String {
    if bundle.terms.is_empty() {
        return String::new();
    }
    let mut text = String::from("BUSINESS TERMS:");
    for scored in &bundle.terms {
        let term = &scored.item;
        text.push_str(&format!("\n- \"{}\" means the field {}", term.phrase, term.field));
        if let Some(table) = &term.table {
            text.push_str(&format!(" (table {table})"));
        }
    }
    text
}

fn example_block(bundle: &RetrievalBundle) -> String {
    if bundle.examples.is_empty() {
        return String::new();
    }
    let mut text = String::from("EXAMPLES:");
    for scored in &bundle.examples {
        let example = &scored.item;
        text.push_str(&format!("\nQ: {}\nSQL: {}", example.question, example.sql));
    }
    text
}

fn article_block(bundle: &RetrievalBundle) -> String {
    if bundle.articles.is_empty() {
        return String::new();
    }
    let mut text = String::from("NOTES:");
    for scored in &bundle.articles {
        let article = &scored.item;
        text.push_str(&format!("\n## {}\n{}", article.title, article.body));
    }
    text
}

fn history_tokens(history: &[HistoryTurn]) -> usize {
    history
        .iter()
        .map(|t| {
            estimate_tokens(&t.question) + t.sql.as_deref().map(estimate_tokens).unwrap_or(0)
        })
        .sum()
}
