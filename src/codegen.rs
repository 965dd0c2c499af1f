//! Delegation-aware program authoring
//!
//! The execution loop does not interpret queries itself: it asks the
//! completion provider to write a Python program that explores the bound
//! `context`, delegates semantic sub-questions through `llm_query` /
//! `llm_query_batch`, and reports its answer with `rlm_final`. This module
//! builds those authoring prompts and extracts the program text from the
//! model's response.

use crate::provider::{CompletionProvider, ProviderError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodeGenError {
    #[error("Code generation LLM error: {0}")]
    LlmError(#[from] ProviderError),

    #[error("No code block found in response: {0}")]
    NoCodeBlock(String),
}

/// Ask the provider to author a delegation-aware program for `query` over a
/// context of `context_len` characters.
pub async fn generate_program(
    provider: &dyn CompletionProvider,
    query: &str,
    context_len: usize,
    max_tokens: u32,
) -> Result<String, CodeGenError> {
    let system = build_system_prompt(context_len);
    let response = provider
        .complete(Some(&system), query, max_tokens)
        .await?;
    extract_code(&response)
}

fn build_system_prompt(context_len: usize) -> String {
    format!(
        r#"You are an RLM (Recursive Language Model) agent answering a query over a large context.

Write ONE complete Python program. Your program runs in a sandbox where these are already defined:
1. `context` - the full input text ({context_len} characters; access it programmatically)
2. `llm_query(prompt)` - delegate one semantic sub-question, returns the answer string
3. `llm_query_batch(prompts)` - delegate a list of sub-questions, returns a list of answers
4. `rlm_final(result)` - report your final answer; call it exactly once, at the end
5. Standard library: re, json, collections, itertools, etc. (import what you need)

WORKFLOW:
1. Explore: probe the context structure programmatically (slices, line counts, patterns)
2. Process: filter, extract, or transform the relevant data in code
3. Delegate: use llm_query()/llm_query_batch() for anything needing semantic judgment
4. Conclude: call rlm_final(answer) with the complete answer

RULES:
- Wrap the program in a ```python code block
- The program must be deterministic apart from llm_query results
- Never print the whole context; work with slices
- Do not fabricate llm_query answers; actually call the function

Example:
```python
sections = context.split("\n\n")
relevant = [s for s in sections if "revenue" in s.lower()]
summaries = llm_query_batch(["Summarize: " + s[:2000] for s in relevant])
rlm_final(" ".join(summaries))
```"#,
        context_len = context_len
    )
}

/// Extract the program text from a model response.
pub fn extract_code(response: &str) -> Result<String, CodeGenError> {
    // Fenced ```python block first, then any fenced block.
    for fence in ["```python\n", "```py\n"] {
        if let Some(start) = response.find(fence) {
            let code_start = start + fence.len();
            if let Some(end) = response[code_start..].find("```") {
                return Ok(response[code_start..code_start + end].trim_end().to_string());
            }
        }
    }

    if let Some(start) = response.find("```\n") {
        let code_start = start + 4;
        if let Some(end) = response[code_start..].find("```") {
            return Ok(response[code_start..code_start + end].trim_end().to_string());
        }
    }

    // A bare program is accepted when it plainly uses the runtime contract.
    let trimmed = response.trim();
    if trimmed.contains("rlm_final(") && !trimmed.contains("```") {
        return Ok(trimmed.to_string());
    }

    Err(CodeGenError::NoCodeBlock(preview(response)))
}

fn preview(response: &str) -> String {
    if response.len() > 200 {
        let cut = response
            .char_indices()
            .take_while(|(i, _)| *i < 200)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", &response[..cut])
    } else {
        response.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_python_fenced_block() {
        let response = "Here's the program:\n```python\nrlm_final(len(context))\n```\nDone.";
        assert_eq!(
            extract_code(response).unwrap(),
            "rlm_final(len(context))"
        );
    }

    #[test]
    fn extract_plain_fenced_block() {
        let response = "```\nrlm_final('x')\n```";
        assert_eq!(extract_code(response).unwrap(), "rlm_final('x')");
    }

    #[test]
    fn extract_bare_program() {
        let response = "answer = llm_query('q')\nrlm_final(answer)";
        assert_eq!(extract_code(response).unwrap(), response);
    }

    #[test]
    fn prose_without_code_is_an_error() {
        let response = "I cannot write a program for this.";
        assert!(matches!(
            extract_code(response),
            Err(CodeGenError::NoCodeBlock(_))
        ));
    }

    #[test]
    fn system_prompt_names_the_runtime_contract() {
        let prompt = build_system_prompt(1234);
        assert!(prompt.contains("llm_query("));
        assert!(prompt.contains("llm_query_batch("));
        assert!(prompt.contains("rlm_final("));
        assert!(prompt.contains("1234"));
    }
}
