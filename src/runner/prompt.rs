//! Layered prompt assembly.
//!
//! Four labeled sections joined by `\n---\n`: base instructions, the role
//! definition, the ask's context, and the task itself.

use serde_json::Value;

use crate::domain::{sha256_hex, Ask};

use super::role::RoleDefinition;

/// Fixed base instructions prepended to every prompt.
const BASE_SECTION: &str = "[BASE]\n\
    You are an answer runner mediating questions from autonomous code \
    executors. Respond with a single JSON object and nothing else. The \
    object may contain the optional fields \"answer_text\" (string), \
    \"answer_json\" (object or array), and \"ask_back\" (string). Summarize \
    aggressively; executors operate under tight token budgets. Do not wrap \
    the object in markdown fences or add commentary outside the JSON.";

/// Assemble the full prompt for an ask.
pub fn build_prompt(
    ask: &Ask,
    role: &RoleDefinition,
    max_tokens: u32,
    timeout_s: u64,
) -> String {
    let mut sections = vec![BASE_SECTION.to_string()];

    let mut role_section = format!(
        "[ROLE]\nid: {}\nversion: {}\npurpose: {}\n\n{}",
        role.id, role.version, role.purpose, role.system_prompt
    );
    if let Some(schema) = &role.input_schema {
        role_section.push_str(&format!("\ninput_schema: {schema}"));
    }
    if let Some(schema) = &role.output_schema {
        role_section.push_str(&format!("\noutput_schema: {schema}"));
    }
    if !role.tool_whitelist.is_empty() {
        role_section.push_str(&format!("\ntools: {}", role.tool_whitelist.join(", ")));
    }
    if let Some(max) = role.limits.max_tokens {
        role_section.push_str(&format!("\nlimit_max_tokens: {max}"));
    }
    if !role.guardrails.is_empty() {
        role_section.push_str("\nguardrails:");
        for guardrail in &role.guardrails {
            role_section.push_str(&format!("\n- {guardrail}"));
        }
    }
    sections.push(role_section);

    let allowed_tools = ask
        .constraints
        .as_ref()
        .map(|c| c.allowed_tools.join(", "))
        .unwrap_or_default();
    let mut context_section = format!(
        "[CONTEXT]\njobId: {}\nstepId: {}\naskType: {}\nallowedTools: [{}]\ntimeoutS: {}\nmaxTokens: {}",
        ask.job_id, ask.step_id, ask.ask_type, allowed_tools, timeout_s, max_tokens
    );
    if let Some(meta) = &ask.meta {
        context_section.push_str(&format!("\nmeta: {meta}"));
    }
    sections.push(context_section);

    let mut task_section = format!("[TASK]\n{}", ask.prompt);
    if let Some(appendix) = meta_override(ask, "system_append").and_then(|v| v.as_str().map(String::from)) {
        task_section.push_str(&format!("\n\n{appendix}"));
    }
    if let Some(schema) = meta_override(ask, "output_schema") {
        task_section.push_str(&format!("\n\nRequired output schema: {schema}"));
    }
    task_section.push_str("\n\nReturn JSON only.");
    sections.push(task_section);

    sections.join("\n---\n")
}

/// Lowercase-hex SHA-256 over the assembled prompt.
pub fn prompt_fingerprint(prompt: &str) -> String {
    sha256_hex(prompt.as_bytes())
}

fn meta_override<'a>(ask: &'a Ask, key: &str) -> Option<&'a Value> {
    ask.meta
        .as_ref()?
        .get("prompt_overrides")?
        .get(key)
        .filter(|v| !v.is_null())
}
