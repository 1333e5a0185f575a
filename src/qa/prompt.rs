use crate::index::SearchHit;

/// Sentence the model must use when the context lacks the answer
pub const NOT_AVAILABLE: &str = "This information is not available in the provided documents.";

const DEFAULT_ROLE: &str = "You are a technical documentation assistant specialized in battery technology, \
battery products, and the sustainability initiatives of battery manufacturers.
You have access to official documents including ESG reports, annual reports, and technical specifications.";

/// Instructional template wrapped around the retrieved context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    role: String,
}

impl Default for PromptTemplate {
    #[inline]
    fn default() -> Self {
        Self {
            role: DEFAULT_ROLE.to_string(),
        }
    }
}

impl PromptTemplate {
    #[inline]
    pub fn with_role(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }

    #[inline]
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Render the full prompt; `question` is embedded verbatim
    #[inline]
    pub fn render(&self, context: &str, question: &str) -> String {
        format!(
            "
<role>
{role}
</role>

<guidelines>
1. ACCURACY: Only use information explicitly stated in the provided context
2. SPECIFICITY: Include technical terms, numerical data, and specific details
3. STRUCTURE: Organize answers with clear paragraphs or bullet points
4. SOURCES: Reference document types when making claims (e.g., \"According to the ESG Report...\")
5. HONESTY: If information is not in the context, state: \"{not_available}\"
6. PROFESSIONAL: Use technical language appropriate for industry professionals
</guidelines>

<context>
{context}
</context>

<question>
{question}
</question>

<answer_format>
Provide a comprehensive answer that:
- Directly addresses the question
- Includes specific data points and technical details
- Structures information clearly
- Cites relevant document sources
- Acknowledges any limitations in available information
</answer_format>

Answer:",
            role = self.role,
            not_available = NOT_AVAILABLE,
        )
    }
}

/// Retrieved chunk texts in retrieval order, separated by blank lines
#[inline]
pub fn format_context(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|hit| hit.chunk.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
