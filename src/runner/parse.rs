//! LLM response parsing and shape validation.

use serde_json::Value;

/// The optional fields an LLM answer may carry.
#[derive(Debug, Clone, Default)]
pub struct ParsedAnswer {
    pub answer_text: Option<String>,
    pub answer_json: Option<Value>,
    pub ask_back: Option<String>,
}

/// Parse an LLM response: locate the outermost `{…}` object and pull the
/// three optional fields from it. With no JSON present, the raw text
/// becomes `answer_text`.
pub fn parse_response(text: &str) -> ParsedAnswer {
    let Some(object) = extract_json_object(text) else {
        return ParsedAnswer {
            answer_text: Some(text.trim().to_string()),
            answer_json: None,
            ask_back: None,
        };
    };

    let has_known_field = ["answer_text", "answer_json", "ask_back"]
        .iter()
        .any(|key| object.get(key).is_some());
    if !has_known_field {
        // A bare object is the answer payload itself.
        return ParsedAnswer {
            answer_text: None,
            answer_json: Some(object),
            ask_back: None,
        };
    }

    ParsedAnswer {
        answer_text: object
            .get("answer_text")
            .and_then(Value::as_str)
            .map(String::from),
        answer_json: object.get("answer_json").filter(|v| !v.is_null()).cloned(),
        ask_back: object
            .get("ask_back")
            .and_then(Value::as_str)
            .map(String::from),
    }
}

/// Find the first balanced `{…}` span and parse it. Braces inside string
/// literals are ignored.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Minimal shape check against a role's output schema: only the top-level
/// `type` (object/array) is enforced.
pub fn validate_output_shape(value: &Value, schema: Option<&Value>) -> bool {
    let Some(schema) = schema else {
        return true;
    };
    match schema.get("type").and_then(Value::as_str) {
        Some("object") => value.is_object(),
        Some("array") => value.is_array(),
        _ => true,
    }
}
