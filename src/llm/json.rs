//! JSON extraction from untrusted completion output.
//!
//! The strict stage parses the whole response (fences stripped). Only when it
//! fails does the lenient stage cut the outermost brace or bracket span out of
//! surrounding prose. Callers see which stage produced the value.

use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStage
{
    Strict,
    /// Substring between the first opening and last closing delimiter
    Lenient,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonExtraction
{
    pub value: Value,
    pub stage: ExtractionStage,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JsonExtractError
{
    #[error("empty response")]
    Empty,

    #[error("no JSON object in response")]
    NoJson,

    #[error("invalid JSON: {0}")]
    Invalid(String),
}

/// Strip a surrounding markdown code fence if present
fn strip_fence(raw: &str) -> &str
{
    let t = raw.trim();
    let Some(rest) = t.strip_prefix("```")
    else
    {
        return t;
    };

    // Drop the info string (e.g. "json") on the fence line
    let body = match rest.find('\n')
    {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };

    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

fn outer_span(
    s: &str,
    open: char,
    close: char,
) -> Option<&str>
{
    let start = s.find(open)?;
    let end = s.rfind(close)?;

    (end > start).then(|| &s[start..=end])
}

pub fn extract_json(raw: &str) -> Result<JsonExtraction, JsonExtractError>
{
    let body = strip_fence(raw);
    if body.is_empty()
    {
        return Err(JsonExtractError::Empty);
    }

    let strict_err = match serde_json::from_str::<Value>(body)
    {
        Ok(value) => return Ok(JsonExtraction { value, stage: ExtractionStage::Strict }),
        Err(e) => e.to_string(),
    };

    // Lenient fallback: objects first, then arrays
    let spans = [outer_span(body, '{', '}'), outer_span(body, '[', ']')];
    let mut saw_span = false;

    for span in spans
        .into_iter()
        .flatten()
    {
        saw_span = true;
        if let Ok(value) = serde_json::from_str::<Value>(span)
        {
            debug!(prefix_chars = body.len() - span.len(), "json_lenient_extraction");
            return Ok(JsonExtraction { value, stage: ExtractionStage::Lenient });
        }
    }

    if saw_span
    {
        Err(JsonExtractError::Invalid(strict_err))
    }
    else
    {
        Err(JsonExtractError::NoJson)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn strict_parse_handles_fenced_output()
    {
        let got = extract_json("```json\n{\"chunks\": []}\n```").unwrap();

        assert_eq!(got.stage, ExtractionStage::Strict);
        assert_eq!(got.value["chunks"], serde_json::json!([]));
    }

    #[test]
    fn lenient_stage_recovers_object_from_prose()
    {
        let got = extract_json("Sure! Here it is: {\"a\": 1} Hope that helps.").unwrap();

        assert_eq!(got.stage, ExtractionStage::Lenient);
        assert_eq!(got.value["a"], 1);
    }

    #[test]
    fn failures_are_classified()
    {
        assert_eq!(extract_json("   "), Err(JsonExtractError::Empty));
        assert_eq!(extract_json("no braces at all"), Err(JsonExtractError::NoJson));
        assert!(matches!(extract_json("{broken"), Err(JsonExtractError::NoJson)));
        assert!(matches!(extract_json("x {\"a\": } y"), Err(JsonExtractError::Invalid(_))));
    }
}
