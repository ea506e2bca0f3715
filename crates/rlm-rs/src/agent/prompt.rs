//! Prompt construction for a run.
//!
//! Only the structure is fixed: a system prompt describing the context and
//! the snippet capabilities, a first user message carrying the query, and one
//! feedback message per non-terminal iteration. The wording can change
//! freely.

use crate::Message;
use crate::agent::config::RlmConfig;
use crate::agent::recursion::RecursionNode;
use crate::context::Context;
use crate::error::SnippetFault;
use crate::sandbox::SnippetOutput;

/// Characters of context shown in the system prompt.
pub const PREVIEW_CHARS: usize = 200;

/// Builder for multi-section system prompts.
///
/// Sections are joined with blank lines. Empty sections are skipped.
///
/// ```
/// use rlm_rs::agent::prompt::SystemPromptBuilder;
///
/// let prompt = SystemPromptBuilder::new("You answer questions.")
///     .section("Context", "A 10-line log.")
///     .section_if(false, "Hidden", || "never shown".into())
///     .section_opt("Missing", None::<String>)
///     .build();
///
/// assert!(prompt.contains("## Context"));
/// assert!(!prompt.contains("Hidden"));
/// ```
pub struct SystemPromptBuilder {
    sections: Vec<String>,
}

impl SystemPromptBuilder {
    /// Start with a preamble, included without a heading.
    pub fn new(preamble: impl Into<String>) -> Self {
        Self {
            sections: vec![preamble.into()],
        }
    }

    /// Append a `## heading` section. Skipped if `content` is empty.
    pub fn section(mut self, heading: &str, content: impl Into<String>) -> Self {
        let content = content.into();
        if !content.is_empty() {
            self.sections.push(format!("## {heading}\n\n{content}"));
        }
        self
    }

    /// Append a section only when `condition` holds. `content_fn` is not
    /// called otherwise.
    pub fn section_if(
        self,
        condition: bool,
        heading: &str,
        content_fn: impl FnOnce() -> String,
    ) -> Self {
        if condition {
            self.section(heading, content_fn())
        } else {
            self
        }
    }

    pub fn section_opt(self, heading: &str, content: Option<impl Into<String>>) -> Self {
        match content {
            Some(c) => self.section(heading, c),
            None => self,
        }
    }

    pub fn build(self) -> String {
        self.sections.join("\n\n")
    }
}

const PREAMBLE: &str = "You answer a question about a body of text that is too large to read \
in one go. The text is not in this conversation. It is loaded in a sandbox as the variable \
`context`, and you inspect it by writing short JavaScript-style snippets. Each snippet runs \
and you see what it printed. Work in small steps: look at the shape of the data, narrow down, \
then answer.";

const CAPABILITIES: &str = "\
Write one snippet per reply inside a ```js fenced block. Only these names exist:

- `context`: the text. `context.length`, `context.slice(a, b)`, `context.search(/re/)` \
(matches with start, end, line, text), `context.grep(/re/)` (matching lines), \
`context.lines(a, b)`, `context.head(n)`, `context.tail(n)`, `context.chunks(size)`.
- `query`: the question.
- `print(...)` / `console.log(...)`: the only way to see results. Output is cut after \
{max_output} characters, so print summaries, not whole slices.
- `len`, `range`, `str`, `String`, `Number`, `parseInt`, `parseFloat`, `JSON`, `Math`, \
`Date.now()`, `Date.iso()`, `Regex.test/findAll/replace`, `Object.keys/values/entries`, \
`Array.isArray`, and the usual string and array methods.
- `llm_query(question, text?)`: ask a sub-model about a piece of text (defaults to the \
whole context) and get its answer as a string.
- `llm_batch([q1, {query, context}, ...])` or \
`await Promise.all([llm_query(...), ...])`: ask several sub-questions in parallel; answers \
come back in order.

Variables you declare at the top level are kept for your next snippet. There is no \
filesystem, network, process or module access, and a snippet that names `process`, \
`require`, `eval`, `fetch` or the like is rejected before it runs.";

const MARKERS: &str = "\
When you know the answer, reply with exactly one of:

- `FINAL(\"your answer\")`
- `FINAL_VAR(name)` to answer with the value of a snippet variable
- `FINAL_WITH_CONFIDENCE({answer: \"...\", confidence: 0.9, reasoning: \"...\"})`

Do not answer before you have looked at the data.";

/// System prompt for a run over `context`.
pub fn system_prompt(context: &Context, config: &RlmConfig, node: &RecursionNode) -> String {
    let preview = context.preview(PREVIEW_CHARS);
    let size = context.size();
    let metadata = format!(
        "Kind: {}\nTotal size: {size} characters\nFirst {} characters:\n```\n{preview}\n```",
        context.kind(),
        PREVIEW_CHARS.min(size),
    );
    SystemPromptBuilder::new(PREAMBLE)
        .section("Context", metadata)
        .section(
            "Sandbox",
            CAPABILITIES.replace("{max_output}", &config.max_output_chars.to_string()),
        )
        .section_if(!node.can_delegate(), "Recursion", || {
            "You are at the maximum delegation depth. `llm_query` will not call a model; \
             answer from the text directly."
                .to_string()
        })
        .section("Answering", MARKERS)
        .build()
}

/// Opening messages of a run: system prompt, then the query.
pub fn initial_messages(
    query: &str,
    context: &Context,
    config: &RlmConfig,
    node: &RecursionNode,
) -> Vec<Message> {
    vec![
        Message::system(system_prompt(context, config, node)),
        Message::user(format!("Question: {query}")),
    ]
}

/// Feedback after a snippet ran.
pub fn output_feedback(output: &SnippetOutput) -> String {
    if output.output.trim().is_empty() {
        "Output:\n(nothing was printed)".to_string()
    } else {
        format!("Output:\n{}", output.output)
    }
}

/// Feedback after a snippet failed.
pub fn fault_feedback(fault: &SnippetFault) -> String {
    let partial = fault.partial_output();
    if partial.is_empty() {
        format!("Error: {fault}")
    } else {
        format!("Error: {fault}\nOutput before the error:\n{partial}")
    }
}

/// Feedback for a reply that carried neither a snippet nor a usable marker.
pub fn nudge() -> String {
    "No code block or final answer found. Reply with a ```js snippet to inspect `context`, \
     or with FINAL(...) once you know the answer."
        .to_string()
}

/// Feedback for a `FINAL_VAR` naming a variable no snippet has set.
pub fn unresolved_var_feedback(name: &str) -> String {
    format!(
        "Error: FINAL_VAR({name}) refers to a variable that does not exist. Set `{name}` in a \
         snippet first, or answer with FINAL(...)."
    )
}
