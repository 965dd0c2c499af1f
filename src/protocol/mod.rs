//! Marker protocol between generated programs and the orchestrator
//!
//! The sandbox boundary only reliably exposes stdout and an exit status, so
//! delegation is signaled textually: a stub function prints a start marker
//! line, the payload, an end marker line, then halts the program. The
//! orchestrator decodes the captured output, resolves the payload out of
//! band, and re-runs the same program with the resolution seeded into a
//! cache so the stub returns silently on the next pass.

use std::collections::BTreeMap;
use thiserror::Error;

/// Start/end markers for a single pending `llm_query` call
pub const CALL_START: &str = "__RLM_CALL_START__";
pub const CALL_END: &str = "__RLM_CALL_END__";

/// Start/end markers for a pending `llm_query_batch` call (JSON array payload)
pub const BATCH_START: &str = "__RLM_BATCH_START__";
pub const BATCH_END: &str = "__RLM_BATCH_END__";

/// Start/end markers for the final result
pub const FINAL_START: &str = "__RLM_FINAL_START__";
pub const FINAL_END: &str = "__RLM_FINAL_END__";

/// Exit code the delegation stubs halt with. Informational only: the loop
/// keys off marker presence, not this value.
pub const HALT_EXIT_CODE: i32 = 3;

/// Errors from decoding captured program output
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed batch payload: {0}")]
    BatchJson(#[from] serde_json::Error),

    #[error("Batch payload is not an array of strings")]
    BatchShape,
}

/// Classification of one execution's raw output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Program produced its final result
    Final(String),
    /// Program is waiting on a batch of delegated prompts
    PendingBatch(Vec<String>),
    /// Program is waiting on a single delegated prompt
    PendingSingle(String),
    /// No complete marker block present
    None,
}

/// Decode raw captured stdout into a protocol classification.
///
/// First-match-wins with FINAL checked before BATCH before SINGLE: a program
/// recovering from cache can both re-request delegation and emit its final
/// result in the same run, and final always wins. A start marker without its
/// matching end marker is treated as "no pending call yet" since output may
/// be truncated mid-stream.
pub fn decode(output: &str) -> Result<Decoded, DecodeError> {
    if let Some(payload) = extract_block(output, FINAL_START, FINAL_END) {
        return Ok(Decoded::Final(payload));
    }

    if let Some(payload) = extract_block(output, BATCH_START, BATCH_END) {
        let value: serde_json::Value = serde_json::from_str(&payload)?;
        let prompts = value
            .as_array()
            .ok_or(DecodeError::BatchShape)?
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or(DecodeError::BatchShape))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Decoded::PendingBatch(prompts));
    }

    if let Some(payload) = extract_block(output, CALL_START, CALL_END) {
        return Ok(Decoded::PendingSingle(payload));
    }

    Ok(Decoded::None)
}

/// Extract the payload between the first complete start/end marker pair.
fn extract_block(output: &str, start: &str, end: &str) -> Option<String> {
    let start_idx = output.find(start)?;
    let payload_start = start_idx + start.len();
    let end_rel = output[payload_start..].find(end)?;
    let payload = &output[payload_start..payload_start + end_rel];
    // Markers sit on their own lines; drop the framing newlines only.
    let payload = payload.strip_prefix('\n').unwrap_or(payload);
    let payload = payload.strip_suffix('\n').unwrap_or(payload);
    Some(payload.to_string())
}

/// Remove every marker-delimited block (and dangling marker lines) from
/// captured output, leaving only the program's own text.
pub fn strip_markers(output: &str) -> String {
    let mut cleaned = String::with_capacity(output.len());
    let mut skipping: Option<&str> = None;

    for line in output.lines() {
        let trimmed = line.trim_end();
        if let Some(end) = skipping {
            if trimmed == end {
                skipping = None;
            }
            continue;
        }
        match trimmed {
            FINAL_START => skipping = Some(FINAL_END),
            BATCH_START => skipping = Some(BATCH_END),
            CALL_START => skipping = Some(CALL_END),
            _ => {
                cleaned.push_str(line);
                cleaned.push('\n');
            }
        }
    }

    cleaned
}

/// Build the interpreter preamble: context binding, resolution cache, and
/// the delegation stubs.
///
/// The preamble is self-contained and regenerated in full before every run,
/// so it never depends on interpreter state surviving between executions. A
/// cache hit returns immediately without emitting markers; a miss prints the
/// markers and halts the program. `llm_query_batch` only short-circuits when
/// every prompt hits, so the resolver always sees one coherent batch.
pub fn build_preamble(context_binding: &str, cache: &BTreeMap<String, String>) -> String {
    // Double encoding: the cache map as JSON, then that JSON as a Python
    // string literal (JSON string escapes are valid Python).
    let cache_json =
        serde_json::to_string(cache).expect("string map serializes");
    let cache_literal =
        serde_json::to_string(&cache_json).expect("string serializes");

    format!(
        r#"import json, sys

{context_binding}

_rlm_cache = json.loads({cache_literal})

def llm_query(prompt):
    prompt = str(prompt)
    if prompt in _rlm_cache:
        return _rlm_cache[prompt]
    sys.stdout.write("\n{call_start}\n")
    sys.stdout.write(prompt)
    sys.stdout.write("\n{call_end}\n")
    sys.stdout.flush()
    raise SystemExit({halt})

def llm_query_batch(prompts):
    prompts = [str(p) for p in prompts]
    if all(p in _rlm_cache for p in prompts):
        return [_rlm_cache[p] for p in prompts]
    sys.stdout.write("\n{batch_start}\n")
    sys.stdout.write(json.dumps(prompts))
    sys.stdout.write("\n{batch_end}\n")
    sys.stdout.flush()
    raise SystemExit({halt})

def rlm_final(result):
    sys.stdout.write("\n{final_start}\n")
    sys.stdout.write(str(result))
    sys.stdout.write("\n{final_end}\n")
    sys.stdout.flush()
"#,
        context_binding = context_binding,
        cache_literal = cache_literal,
        call_start = CALL_START,
        call_end = CALL_END,
        batch_start = BATCH_START,
        batch_end = BATCH_END,
        final_start = FINAL_START,
        final_end = FINAL_END,
        halt = HALT_EXIT_CODE,
    )
}

/// Python statement binding `context` to an inline payload.
pub fn inline_context_binding(context: &str) -> String {
    let literal = serde_json::to_string(context).expect("string serializes");
    format!("context = json.loads({})", serde_json::to_string(&literal).expect("string serializes"))
}

/// Python statement binding `context` to a side-channel file's contents.
pub fn file_context_binding(path: &str) -> String {
    let literal = serde_json::to_string(path).expect("string serializes");
    format!("context = open({}, encoding=\"utf-8\").read()", literal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(start: &str, payload: &str, end: &str) -> String {
        format!("\n{}\n{}\n{}\n", start, payload, end)
    }

    #[test]
    fn decode_single_pending_call() {
        let out = format!("probing...\n{}", block(CALL_START, "summarize part 1", CALL_END));
        assert_eq!(
            decode(&out).unwrap(),
            Decoded::PendingSingle("summarize part 1".to_string())
        );
    }

    #[test]
    fn decode_batch_pending_call() {
        let out = block(BATCH_START, r#"["a","b"]"#, BATCH_END);
        assert_eq!(
            decode(&out).unwrap(),
            Decoded::PendingBatch(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn decode_empty_batch_is_valid() {
        let out = block(BATCH_START, "[]", BATCH_END);
        assert_eq!(decode(&out).unwrap(), Decoded::PendingBatch(vec![]));
    }

    #[test]
    fn final_wins_over_pending() {
        let out = format!(
            "{}{}",
            block(BATCH_START, r#"["x"]"#, BATCH_END),
            block(FINAL_START, "42", FINAL_END)
        );
        assert_eq!(decode(&out).unwrap(), Decoded::Final("42".to_string()));
    }

    #[test]
    fn malformed_batch_json_is_fatal() {
        let out = block(BATCH_START, "[not json", BATCH_END);
        assert!(matches!(decode(&out), Err(DecodeError::BatchJson(_))));
    }

    #[test]
    fn batch_of_non_strings_is_fatal() {
        let out = block(BATCH_START, "[1, 2]", BATCH_END);
        assert!(matches!(decode(&out), Err(DecodeError::BatchShape)));
    }

    #[test]
    fn start_without_end_is_none() {
        let out = format!("partial output\n{}\ntrunc", CALL_START);
        assert_eq!(decode(&out).unwrap(), Decoded::None);
    }

    #[test]
    fn decode_is_pure() {
        let out = block(CALL_START, "same prompt", CALL_END);
        assert_eq!(decode(&out).unwrap(), decode(&out).unwrap());
    }

    #[test]
    fn strip_removes_marker_blocks() {
        let out = format!(
            "line one\n{}line two\n",
            block(CALL_START, "hidden prompt", CALL_END)
        );
        let cleaned = strip_markers(&out);
        assert!(cleaned.contains("line one"));
        assert!(cleaned.contains("line two"));
        assert!(!cleaned.contains("hidden prompt"));
        assert!(!cleaned.contains(CALL_START));
    }

    #[test]
    fn preamble_seeds_cache_and_redefines_stubs() {
        let mut cache = BTreeMap::new();
        cache.insert("what is 2+2".to_string(), "4".to_string());
        let preamble = build_preamble("context = \"\"", &cache);
        assert!(preamble.contains("def llm_query("));
        assert!(preamble.contains("def llm_query_batch("));
        assert!(preamble.contains("def rlm_final("));
        assert!(preamble.contains("what is 2+2"));
        // Same inputs, same preamble: nothing depends on mutable state.
        assert_eq!(preamble, build_preamble("context = \"\"", &cache));
    }

    #[test]
    fn inline_binding_escapes_payload() {
        let binding = inline_context_binding("line\n\"quoted\"");
        assert!(binding.starts_with("context = json.loads("));
        assert!(!binding.contains('\n'));
    }
}
