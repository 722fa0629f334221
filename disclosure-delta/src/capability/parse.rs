//! Two-phase decoding of capability output.
//!
//! Phase one decodes the schema-conformant value (or the whole text) as-is.
//! Phase two makes exactly one fallback extraction: a fenced ```json block,
//! else the first balanced brace block. Anything else is `Malformed`.

use serde::de::DeserializeOwned;

use super::{CapabilityError, CapabilityOutput};

/// Decode capability output into `T`.
pub fn decode_structured<T: DeserializeOwned>(output: &CapabilityOutput) -> Result<T, CapabilityError> {
    let text = match output {
        CapabilityOutput::Structured(value) => {
            if let Ok(decoded) = serde_json::from_value::<T>(value.clone()) {
                return Ok(decoded);
            }
            output.as_text()
        }
        CapabilityOutput::Text(text) => {
            if let Ok(decoded) = serde_json::from_str::<T>(text.trim()) {
                return Ok(decoded);
            }
            text.clone()
        }
    };

    let block = extract_json(&text)
        .ok_or_else(|| CapabilityError::Malformed("no JSON object in output".into()))?;

    serde_json::from_str(block).map_err(|e| CapabilityError::Malformed(e.to_string()))
}

/// Extract the JSON payload of a response that may wrap it in prose or
/// markdown fences.
pub fn extract_json(content: &str) -> Option<&str> {
    if let Some(start) = content.find("```json") {
        let start = start + 7;
        if let Some(end) = content[start..].find("```") {
            return Some(content[start..start + end].trim());
        }
    }

    let start = content.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in content[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&content[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }

    None
}
