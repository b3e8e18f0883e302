//! Bounded prompt assembly.
//!
//! A generation prompt combines the user prompt, prior conversation, and
//! retrieved reference texts. When the estimate exceeds the model window the
//! assembler degrades step by step:
//!
//! ```text
//! TryFull ──fits──▶ done
//!    │
//!    ▼
//! DropReferences ── pop lowest-ranked reference while count > min ──fits──▶ done
//!    │ (count == min)
//!    ▼
//! SummarizeHistory ── one summarizer call, rebuild ──fits──▶ done
//!    │
//!    ▼
//! Fail ──▶ Error::ContextWindowExceeded
//! ```
//!
//! Tokens are estimated as `chars / chars_per_token`.

use crate::error::{Error, Result};
use crate::llm::LanguageModel;
use crate::models::{HistoryEntry, QueryReference};

pub const HUMAN_PREFIX: &str = "Human input: ";
pub const AI_PREFIX: &str = "AI response: ";

/// Token budget of the target model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub chars_per_token: usize,
    /// `None` disables the check.
    pub max_tokens: Option<usize>,
}

impl ContextBudget {
    pub fn new(chars_per_token: usize, max_tokens: Option<usize>) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
            max_tokens,
        }
    }

    /// Approximate token count, rounded up.
    pub fn estimate_tokens(&self, prompt: &str) -> usize {
        prompt.chars().count().div_ceil(self.chars_per_token.max(1))
    }

    pub fn fits(&self, prompt: &str) -> bool {
        match self.max_tokens {
            Some(limit) => self.estimate_tokens(prompt) <= limit,
            None => true,
        }
    }

    /// Fail with [`Error::ContextWindowExceeded`] if `prompt` is over budget.
    pub fn check(&self, prompt: &str) -> Result<()> {
        match self.max_tokens {
            Some(limit) if !self.fits(prompt) => Err(Error::ContextWindowExceeded {
                tokens: self.estimate_tokens(prompt),
                limit,
            }),
            _ => Ok(()),
        }
    }
}

/// Render conversation history as alternating human/AI lines.
pub fn history_prompt(history: &[HistoryEntry]) -> String {
    let mut lines = Vec::with_capacity(history.len() * 2);
    for entry in history {
        if !entry.prompt.is_empty() {
            lines.push(format!("{}{}", HUMAN_PREFIX, entry.prompt));
        }
        if !entry.response.is_empty() {
            lines.push(format!("{}{}", AI_PREFIX, entry.response));
        }
    }
    lines.join("\n\n")
}

/// The prompt sent to the generation model.
pub fn question_prompt(prompt: &str, chat_history: &str, references: &[QueryReference]) -> String {
    let mut out = String::from(
        "Use the following pieces of context to answer the question at the end. \
         If you don't know the answer, say that you don't know instead of making one up.\n\n",
    );
    for reference in references {
        out.push_str("Context: ");
        out.push_str(reference.text());
        out.push_str("\n\n");
    }
    if !chat_history.is_empty() {
        out.push_str("Previous conversation:\n");
        out.push_str(chat_history);
        out.push_str("\n\n");
    }
    out.push_str("Question: ");
    out.push_str(prompt);
    out.push_str("\nHelpful Answer:");
    out
}

pub fn summarize_prompt(chat_history: &str) -> String {
    format!(
        "Summarize the following conversation between a human and an AI assistant. \
         Keep every fact needed to continue the conversation.\n\n{}\n\nSummary:",
        chat_history
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStage {
    TryFull,
    DropReferences,
    SummarizeHistory,
    Fail,
}

/// A prompt that fits the budget plus the references it kept.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub prompt: String,
    pub references: Vec<QueryReference>,
    /// Stage at which the prompt first fit.
    pub stage: AssemblyStage,
}

pub struct ContextAssembler<'a> {
    budget: ContextBudget,
    min_references: usize,
    summarizer: &'a dyn LanguageModel,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(budget: ContextBudget, min_references: usize, summarizer: &'a dyn LanguageModel) -> Self {
        Self {
            budget,
            min_references,
            summarizer,
        }
    }

    /// Build a prompt that fits the budget, degrading as needed.
    ///
    /// `references` must be ordered best first; the tail is dropped first.
    ///
    /// # Errors
    ///
    /// [`Error::ContextWindowExceeded`] once every stage has been tried, or
    /// [`Error::Internal`] if the summarizer call fails.
    pub async fn assemble(
        &self,
        prompt: &str,
        history: &[HistoryEntry],
        references: Vec<QueryReference>,
    ) -> Result<AssembledPrompt> {
        let mut chat_history = history_prompt(history);
        let mut references = references;
        let mut stage = AssemblyStage::TryFull;
        let mut candidate = question_prompt(prompt, &chat_history, &references);

        loop {
            match stage {
                AssemblyStage::TryFull => {
                    if self.budget.fits(&candidate) {
                        break;
                    }
                    stage = AssemblyStage::DropReferences;
                }
                AssemblyStage::DropReferences => {
                    if references.len() <= self.min_references {
                        stage = AssemblyStage::SummarizeHistory;
                        continue;
                    }
                    if let Some(dropped) = references.pop() {
                        tracing::info!(reference = %dropped.id, "dropped reference to fit context window");
                    }
                    candidate = question_prompt(prompt, &chat_history, &references);
                    if self.budget.fits(&candidate) {
                        break;
                    }
                }
                AssemblyStage::SummarizeHistory => {
                    if chat_history.is_empty() {
                        stage = AssemblyStage::Fail;
                        continue;
                    }
                    tracing::info!(model = self.summarizer.model_name(), "summarizing chat history");
                    chat_history = self
                        .summarizer
                        .generate(&summarize_prompt(&chat_history), &[])
                        .await?;
                    candidate = question_prompt(prompt, &chat_history, &references);
                    if self.budget.fits(&candidate) {
                        break;
                    }
                    stage = AssemblyStage::Fail;
                }
                AssemblyStage::Fail => {
                    self.budget.check(&candidate)?;
                    break;
                }
            }
        }

        Ok(AssembledPrompt {
            prompt: candidate,
            references,
            stage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatTurn;
    use crate::models::{QueryEngine, QueryEngineType, ReferenceContent};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSummarizer {
        summary: String,
        calls: AtomicUsize,
    }

    impl FixedSummarizer {
        fn new(summary: &str) -> Self {
            Self {
                summary: summary.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for FixedSummarizer {
        fn model_name(&self) -> &str {
            "summarizer"
        }
        fn context_length(&self) -> Option<usize> {
            None
        }
        async fn generate(&self, _prompt: &str, _chat: &[ChatTurn]) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.summary.clone())
        }
    }

    fn refs(n: usize, len: usize) -> Vec<QueryReference> {
        let engine = QueryEngine::new("e", QueryEngineType::LlmService, "u");
        (0..n)
            .map(|i| {
                QueryReference::new(
                    &engine,
                    "u",
                    "gs://b/doc.txt",
                    ReferenceContent::Text {
                        text: format!("{}{}", i, "x".repeat(len)),
                    },
                )
            })
            .collect()
    }

    fn history(len: usize) -> Vec<HistoryEntry> {
        vec![HistoryEntry {
            prompt: "y".repeat(len),
            response: "z".repeat(len),
            reference_ids: vec![],
        }]
    }

    #[test]
    fn test_history_prompt_format() {
        let history = vec![
            HistoryEntry {
                prompt: "hi".into(),
                response: "hello".into(),
                reference_ids: vec![],
            },
            HistoryEntry {
                prompt: "more".into(),
                response: String::new(),
                reference_ids: vec![],
            },
        ];
        assert_eq!(
            history_prompt(&history),
            "Human input: hi\n\nAI response: hello\n\nHuman input: more"
        );
    }

    #[test]
    fn test_budget_estimate() {
        let budget = ContextBudget::new(3, Some(2));
        assert_eq!(budget.estimate_tokens("abcdef"), 2);
        assert!(budget.fits("abcdef"));
        assert!(!budget.fits("abcdefg"));
        assert!(matches!(
            budget.check("abcdefg"),
            Err(Error::ContextWindowExceeded { tokens: 3, limit: 2 })
        ));
        assert!(ContextBudget::new(3, None).fits(&"x".repeat(10_000)));
    }

    #[tokio::test]
    async fn test_fits_without_mitigation() {
        let summarizer = FixedSummarizer::new("s");
        let assembler = ContextAssembler::new(ContextBudget::new(3, Some(10_000)), 2, &summarizer);
        let out = assembler.assemble("q", &history(10), refs(5, 10)).await.unwrap();
        assert_eq!(out.stage, AssemblyStage::TryFull);
        assert_eq!(out.references.len(), 5);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drops_references_until_fit() {
        let summarizer = FixedSummarizer::new("s");
        let base = question_prompt("q", "", &refs(3, 300)).chars().count();
        let budget = ContextBudget::new(1, Some(base));
        let assembler = ContextAssembler::new(budget, 2, &summarizer);
        let out = assembler.assemble("q", &[], refs(5, 300)).await.unwrap();
        assert_eq!(out.stage, AssemblyStage::DropReferences);
        assert_eq!(out.references.len(), 3);
        assert!(out.references[0].text().starts_with('0'));
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stops_at_min_then_summarizes() {
        let summarizer = FixedSummarizer::new("short summary");
        let with_two = question_prompt("q", "short summary", &refs(2, 100)).chars().count();
        let budget = ContextBudget::new(1, Some(with_two));
        let assembler = ContextAssembler::new(budget, 2, &summarizer);
        let out = assembler
            .assemble("q", &history(5_000), refs(6, 100))
            .await
            .unwrap();
        assert_eq!(out.stage, AssemblyStage::SummarizeHistory);
        assert_eq!(out.references.len(), 2);
        assert!(out.prompt.contains("short summary"));
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fails_after_all_stages() {
        let summarizer = FixedSummarizer::new(&"s".repeat(5_000));
        let assembler = ContextAssembler::new(ContextBudget::new(3, Some(100)), 2, &summarizer);
        let err = assembler
            .assemble("q", &history(5_000), refs(4, 1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ContextWindowExceeded { limit: 100, .. }));
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_history_skips_summarizer() {
        let summarizer = FixedSummarizer::new("s");
        let assembler = ContextAssembler::new(ContextBudget::new(3, Some(10)), 2, &summarizer);
        let err = assembler.assemble("q", &[], refs(3, 500)).await.unwrap_err();
        assert!(matches!(err, Error::ContextWindowExceeded { .. }));
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
    }
}
