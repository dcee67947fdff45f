// apps/kernel-server/src/capability.rs
// Purpose: Computes the authoritative tool set for an invocation. §4.4
// Architecture: Domain Logic
// Dependencies: none (pure functions)

pub const WEB_SEARCH: &str = "web_search";
pub const CODE_EXECUTION: &str = "code_execution";
pub const FILE_WRITE: &str = "file_write";
pub const READ_FILE: &str = "read_file";
pub const LIST_FILES: &str = "list_files";

const POWER_TOOLS: [&str; 3] = [WEB_SEARCH, CODE_EXECUTION, FILE_WRITE];

fn add(tools: &mut Vec<String>, tool: &str) {
    if !tools.iter().any(|t| t == tool) {
        tools.push(tool.to_string());
    }
}

/// Computes the union of manifest-declared tools, read-only tools, and
/// identity-implied tools (matched by substring on a lowercased id), plus
/// code-execution when dynamic artifact files will be mounted.
///
/// The manifest can *add* capabilities identity would not; identity
/// *guarantees minimums*. Neither side can silently drop what the other
/// grants.
pub fn provision(agent_id: &str, manifest_tools: &[String], has_dynamic_files: bool) -> Vec<String> {
    let mut tools: Vec<String> = manifest_tools.to_vec();

    add(&mut tools, READ_FILE);
    add(&mut tools, LIST_FILES);

    let lowered = agent_id.to_lowercase();

    if lowered.starts_with("master") || lowered.starts_with("orch") {
        for t in POWER_TOOLS {
            add(&mut tools, t);
        }
    } else {
        if lowered.contains("research") || lowered.contains("web") {
            add(&mut tools, WEB_SEARCH);
        }
        if lowered.contains("analy") || lowered.contains("code") || lowered.contains("math") {
            add(&mut tools, CODE_EXECUTION);
        }
        if lowered.contains("writ") || lowered.contains("code") || lowered.contains("log") {
            add(&mut tools, FILE_WRITE);
        }
    }

    if has_dynamic_files {
        add(&mut tools, CODE_EXECUTION);
    }

    tools
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains_all(tools: &[String], expected: &[&str]) -> bool {
        expected.iter().all(|e| tools.iter().any(|t| t == e))
    }

    #[test]
    fn researcher_gets_web_search_even_without_manifest_request() {
        let tools = provision("research_trends", &[], false);
        assert!(contains_all(&tools, &[WEB_SEARCH, READ_FILE, LIST_FILES]));
    }

    #[test]
    fn coder_gets_code_execution_and_file_write() {
        let tools = provision("coder_backend", &[], false);
        assert!(contains_all(&tools, &[CODE_EXECUTION, FILE_WRITE]));
    }

    #[test]
    fn master_prefix_gets_all_power_tools() {
        let tools = provision("master_planner", &[], false);
        assert!(contains_all(&tools, &POWER_TOOLS));
    }

    #[test]
    fn orch_prefix_gets_all_power_tools() {
        let tools = provision("orch_root", &[], false);
        assert!(contains_all(&tools, &POWER_TOOLS));
    }

    #[test]
    fn manifest_tools_are_never_dropped() {
        let tools = provision("plain_worker", &["custom_tool".to_string()], false);
        assert!(tools.iter().any(|t| t == "custom_tool"));
    }

    #[test]
    fn dynamic_files_force_code_execution_regardless_of_identity() {
        let tools = provision("writer_summary", &[], true);
        assert!(tools.iter().any(|t| t == CODE_EXECUTION));
    }

    #[test]
    fn naming_variation_is_tolerated_via_substring() {
        // "researcher" (not "research_") still matches the substring rule.
        let tools = provision("researcher_01", &[], false);
        assert!(tools.iter().any(|t| t == WEB_SEARCH));
    }

    #[test]
    fn result_is_superset_of_manifest_and_identity_tools() {
        let manifest = vec!["custom_tool".to_string()];
        let tools = provision("analyze_risk", &manifest, false);
        assert!(manifest.iter().all(|t| tools.contains(t)));
        assert!(tools.contains(&CODE_EXECUTION.to_string()));
    }
}
