// apps/kernel-server/src/protocol.rs
// Purpose: Post-flight validation of an adapter response against the
// required response contract, independent of transport-level success. §4.7
// Architecture: Domain Logic
// Dependencies: models

const SEMANTIC_NULL_MARKER: &str = "[STATUS: NULL]";
const BYPASS_PREFIX: &str = "[BYPASS:";

const WEB_SEARCH: &str = "web_search";
const CODE_EXECUTION: &str = "code_execution";
const FILE_WRITE: &str = "file_write";

fn output_text(output: &serde_json::Value) -> String {
    output
        .get("result")
        .and_then(|v| v.as_str())
        .or_else(|| output.get("output").and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string()
}

fn is_semantic_null(text: &str) -> bool {
    text.contains(SEMANTIC_NULL_MARKER)
}

fn is_bypassed(text: &str) -> bool {
    text.trim_start().starts_with(BYPASS_PREFIX)
}

/// "Used" is the union of the adapter's explicit executed-tools list and
/// textual evidence of the tool's name appearing in the agent's own output
/// (a model that narrates "searched the web for..." without the adapter
/// recording the call still counts, per spec.md §4.7).
fn used(tool: &str, text: &str, executed_tools: &[String]) -> bool {
    executed_tools.iter().any(|t| t == tool) || text.to_lowercase().contains(tool)
}

/// Checks a successful adapter response against the required contract:
/// non-bypassed research agents must have searched, non-bypassed
/// analyst/coder agents must have produced an artifact (code execution or a
/// file write). Semantic null and bypass are reported as distinct violations
/// so the Circuit Breaker's reason is specific.
pub fn validate(agent_id: &str, output: &Option<serde_json::Value>, executed_tools: &[String]) -> Result<(), String> {
    let Some(output) = output else {
        return Err(format!("agent '{}' reported success with no output payload", agent_id));
    };

    let text = output_text(output);

    if is_semantic_null(&text) {
        return Err(format!("agent '{}' returned a semantic null ([STATUS: NULL])", agent_id));
    }

    if is_bypassed(&text) {
        return Ok(());
    }

    if agent_id.starts_with("research_") && !used(WEB_SEARCH, &text, executed_tools) {
        return Err(format!("research agent '{}' did not search (no web_search usage)", agent_id));
    }

    if (agent_id.starts_with("analyze_") || agent_id.starts_with("coder_"))
        && !used(CODE_EXECUTION, &text, executed_tools)
        && !used(FILE_WRITE, &text, executed_tools)
    {
        return Err(format!("analyst/coder '{}' produced no artifact", agent_id));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_output_is_rejected() {
        let result = validate("writer_final", &None, &[]);
        assert!(result.is_err());
    }

    #[test]
    fn semantic_null_marker_is_rejected() {
        let out = json!({"result": "[STATUS: NULL]"});
        let result = validate("worker_plain", &Some(out), &[]);
        assert!(result.is_err());
    }

    #[test]
    fn bypass_marker_skips_identity_checks() {
        let out = json!({"result": "[BYPASS: nothing relevant to research here]"});
        let result = validate("research_trends", &Some(out), &[]);
        assert!(result.is_ok());
    }

    #[test]
    fn researcher_without_search_is_rejected() {
        let out = json!({"result": "Found three relevant papers."});
        let result = validate("research_trends", &Some(out), &[]);
        assert!(result.is_err());
    }

    #[test]
    fn researcher_with_explicit_tool_call_passes() {
        let out = json!({"result": "Found three relevant papers."});
        let result = validate("research_trends", &Some(out), &["web_search".to_string()]);
        assert!(result.is_ok());
    }

    #[test]
    fn researcher_with_only_textual_evidence_passes() {
        let out = json!({"result": "I ran a web_search and found three relevant papers."});
        let result = validate("research_trends", &Some(out), &[]);
        assert!(result.is_ok());
    }

    #[test]
    fn analyst_with_no_code_or_write_is_rejected() {
        let out = json!({"result": "The data looks fine to me."});
        let result = validate("analyze_metrics", &Some(out), &[]);
        assert!(result.is_err());
    }

    #[test]
    fn coder_with_file_write_passes() {
        let out = json!({"result": "Implemented the fix."});
        let result = validate("coder_backend", &Some(out), &["file_write".to_string()]);
        assert!(result.is_ok());
    }

    #[test]
    fn plain_worker_with_no_identity_prefix_always_passes() {
        let out = json!({"result": "done"});
        let result = validate("node_42", &Some(out), &[]);
        assert!(result.is_ok());
    }

    #[test]
    fn research_substring_without_prefix_is_not_checked() {
        // "researcher_01" doesn't *start with* "research_" so the strict
        // protocol rule (distinct from capability.rs's looser substring
        // match) doesn't apply here.
        let out = json!({"result": "done"});
        let result = validate("researcher_01", &Some(out), &[]);
        assert!(result.is_ok());
    }
}
