//! Prompt assembly from retrieved context.

use crate::document::SearchResult;

/// Placeholder replaced by the retrieved context block.
pub const CONTEXT_PLACEHOLDER: &str = "{context}";

/// Placeholder replaced by the user's question.
pub const QUESTION_PLACEHOLDER: &str = "{question}";

/// The prompt used unless the configuration supplies another one.
pub const DEFAULT_TEMPLATE: &str = "\
The following passages were retrieved from the knowledge base:
{context}

Answer the user's question based on the passages above:
{question}

If the knowledge base contains nothing relevant, answer with your own \
carefully reasoned thoughts instead, and do not simply repeat the question.";

/// A prompt template with `{context}` and `{question}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    template: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE)
    }
}

impl PromptTemplate {
    /// Wrap `template`. Placeholder presence is checked by config validation.
    pub fn new(template: impl Into<String>) -> Self {
        Self { template: template.into() }
    }

    /// Fill in the context block and the question.
    pub fn render(&self, context: &str, question: &str) -> String {
        // Split on the question first so placeholders inside retrieved text are never expanded.
        let (head, tail) = match self.template.split_once(QUESTION_PLACEHOLDER) {
            Some((head, tail)) => (head, Some(tail)),
            None => (self.template.as_str(), None),
        };
        let mut out = head.replace(CONTEXT_PLACEHOLDER, context);
        if let Some(tail) = tail {
            out.push_str(question);
            out.push_str(&tail.replace(CONTEXT_PLACEHOLDER, context));
        }
        out
    }
}

/// Join retrieved chunk texts, in result order, separated by blank lines.
pub fn context_block(results: &[SearchResult]) -> String {
    results.iter().map(|r| r.chunk.text.as_str()).collect::<Vec<_>>().join("\n\n")
}
