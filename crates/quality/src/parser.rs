//! Parsing of external tool and inference output into findings.
//!
//! Tools report JSON of the shape `{"findings": [...], "metrics": {...}}`;
//! both parts can be relocated with dotted paths (`report.issues`,
//! `runs[0].results`). Each finding entry accepts:
//!
//! - `id` - identifier (defaults to `<validator>.<index>`)
//! - `severity` - label; unknown labels become `info` and keep the label as
//!   the native severity for registry mapping
//! - `message` (or `msg`)
//! - `file`, `line`, `column`, `region`
//! - `remediation`, `rule`, `category`

use serde_json::Value as JsonValue;
use stagegate_core::{Category, Finding, Location, Severity};
use std::collections::BTreeMap;

/// Parse failures. Callers turn these into `malformed-result` errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    /// Output is not JSON
    #[error("output is not valid JSON: {0}")]
    NotJson(String),

    /// A path does not exist in the document
    #[error("path '{0}' not found in output")]
    MissingPath(String),

    /// A value has the wrong shape
    #[error("unexpected value at '{path}': {reason}")]
    Shape {
        /// Where
        path: String,
        /// What was expected
        reason: String,
    },
}

/// Findings and metrics read from a tool's report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolReport {
    /// Findings in report order
    pub findings: Vec<Finding>,
    /// Numeric metrics
    pub metrics: BTreeMap<String, f64>,
}

/// Parse a tool's JSON report.
///
/// `findings_path` must exist; a missing `metrics_path` just yields no
/// metrics. Non-numeric metrics are ignored.
pub fn parse_tool_report(
    output: &str,
    validator_id: &str,
    category: Category,
    findings_path: &str,
    metrics_path: &str,
) -> Result<ToolReport, ParseError> {
    let json: JsonValue =
        serde_json::from_str(output.trim()).map_err(|e| ParseError::NotJson(e.to_string()))?;

    let entries = navigate(&json, findings_path)
        .ok_or_else(|| ParseError::MissingPath(findings_path.to_string()))?
        .as_array()
        .ok_or_else(|| ParseError::Shape {
            path: findings_path.to_string(),
            reason: "expected an array of findings".to_string(),
        })?;

    let findings = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| parse_finding(entry, validator_id, i, category))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|reason| ParseError::Shape {
            path: findings_path.to_string(),
            reason,
        })?;

    let metrics = navigate(&json, metrics_path)
        .and_then(JsonValue::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
                .collect()
        })
        .unwrap_or_default();

    Ok(ToolReport { findings, metrics })
}

/// Judgment returned by an inference backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedJudgment {
    /// Score in [0,100], if given
    pub score: Option<f64>,
    /// Confidence in [0,1], if given
    pub confidence: Option<f64>,
    /// Issues raised
    pub findings: Vec<Finding>,
}

/// Parse a judgment. Models often wrap JSON in prose, so the outermost
/// `{...}` span is used when the whole text is not JSON.
pub fn parse_judgment(
    content: &str,
    validator_id: &str,
    category: Category,
) -> Result<ParsedJudgment, ParseError> {
    let json = extract_json(content)?;

    let number = |key: &str| json.get(key).and_then(JsonValue::as_f64);
    let findings = match json.get("findings") {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(entries)) => entries
            .iter()
            .enumerate()
            .map(|(i, entry)| parse_finding(entry, validator_id, i, category))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| ParseError::Shape {
                path: "findings".to_string(),
                reason,
            })?,
        Some(_) => {
            return Err(ParseError::Shape {
                path: "findings".to_string(),
                reason: "expected an array".to_string(),
            })
        }
    };

    Ok(ParsedJudgment {
        score: number("score"),
        confidence: number("confidence"),
        findings,
    })
}

fn extract_json(content: &str) -> Result<JsonValue, ParseError> {
    let trimmed = content.trim();
    if let Ok(json @ JsonValue::Object(_)) = serde_json::from_str(trimmed) {
        return Ok(json);
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&trimmed[start..=end])
            .map_err(|e| ParseError::NotJson(e.to_string())),
        _ => Err(ParseError::NotJson("no JSON object in response".to_string())),
    }
}

fn parse_finding(
    entry: &JsonValue,
    validator_id: &str,
    index: usize,
    default_category: Category,
) -> Result<Finding, String> {
    let obj = entry
        .as_object()
        .ok_or_else(|| format!("finding {} is not an object", index))?;
    let text = |key: &str| obj.get(key).and_then(JsonValue::as_str);
    let number = |key: &str| obj.get(key).and_then(JsonValue::as_u64).map(|n| n as usize);

    let message = text("message")
        .or_else(|| text("msg"))
        .ok_or_else(|| format!("finding {} has no message", index))?;
    let id = text("id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}.{}", validator_id, index));
    let category = text("category")
        .and_then(|c| c.parse().ok())
        .unwrap_or(default_category);

    let label = text("severity").unwrap_or("info");
    let mut finding = match label.parse::<Severity>() {
        Ok(severity) => Finding::new(id, category, severity, message),
        Err(_) => Finding::new(id, category, Severity::Info, message).with_native_severity(label),
    };

    if let Some(file) = text("file") {
        finding = finding.with_location(Location {
            file: file.to_string(),
            line: number("line"),
            column: number("column"),
            region: text("region").map(str::to_string),
        });
    }
    if let Some(remediation) = text("remediation") {
        finding = finding.with_remediation(remediation);
    }
    if let Some(rule) = text("rule") {
        finding = finding.with_rule(rule);
    }
    Ok(finding)
}

/// Navigate a JSON document with a dotted path.
///
/// Supports simple dot notation and array indexing:
/// - `field` - root field
/// - `field.nested` - nested field
/// - `array[0]` - array element
/// - `field.array[0].nested` - combined
///
/// An empty path is the document itself.
pub fn navigate<'a>(json: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = json;

    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }

        if let Some(bracket_pos) = part.find('[') {
            let key = &part[..bracket_pos];
            let index_part = part[bracket_pos + 1..].strip_suffix(']')?;

            if !key.is_empty() {
                current = current.get(key)?;
            }

            let index: usize = index_part.parse().ok()?;
            current = current.get(index)?;
        } else {
            current = current.get(part)?;
        }
    }

    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_navigate() {
        let doc = json!({
            "runs": [{ "results": [1, 2] }],
            "summary": { "score": 91 }
        });
        assert_eq!(navigate(&doc, "summary.score"), Some(&json!(91)));
        assert_eq!(navigate(&doc, "runs[0].results[1]"), Some(&json!(2)));
        assert_eq!(navigate(&doc, ""), Some(&doc));
        assert_eq!(navigate(&doc, "runs[3]"), None);
        assert_eq!(navigate(&doc, "runs[0"), None);
    }

    #[test]
    fn test_parse_tool_report() {
        let output = r#"{
            "findings": [
                {"id": "S1", "severity": "high", "message": "hardcoded key", "file": "src/a.rs", "line": 4},
                {"severity": "BLOCKER", "msg": "bad", "rule": "R9"}
            ],
            "metrics": {"score": 72.5, "tool": "scanner"}
        }"#;
        let report =
            parse_tool_report(output, "scan", Category::Security, "findings", "metrics").unwrap();

        assert_eq!(report.findings.len(), 2);
        assert_eq!(report.findings[0].severity, Severity::High);
        assert_eq!(report.findings[0].location.as_ref().unwrap().line, Some(4));
        assert_eq!(report.findings[1].id, "scan.1");
        assert_eq!(report.findings[1].severity, Severity::Info);
        assert_eq!(report.findings[1].native_severity.as_deref(), Some("BLOCKER"));
        assert_eq!(report.findings[1].rule.as_deref(), Some("R9"));
        assert_eq!(report.metrics.get("score"), Some(&72.5));
        assert!(!report.metrics.contains_key("tool"));
    }

    #[test]
    fn test_parse_tool_report_errors() {
        assert!(matches!(
            parse_tool_report("not json", "v", Category::Quality, "findings", "metrics"),
            Err(ParseError::NotJson(_))
        ));
        assert!(matches!(
            parse_tool_report("{}", "v", Category::Quality, "findings", "metrics"),
            Err(ParseError::MissingPath(_))
        ));
        assert!(matches!(
            parse_tool_report(
                r#"{"findings": [{"severity": "low"}]}"#,
                "v",
                Category::Quality,
                "findings",
                "metrics"
            ),
            Err(ParseError::Shape { .. })
        ));
    }

    #[test]
    fn test_parse_judgment_in_prose() {
        let content = "Here is my assessment:\n{\"score\": 64, \"confidence\": 0.8, \"findings\": [{\"severity\": \"medium\", \"message\": \"abrupt ending\"}]}\nThanks.";
        let judgment = parse_judgment(content, "tone", Category::Quality).unwrap();
        assert_eq!(judgment.score, Some(64.0));
        assert_eq!(judgment.confidence, Some(0.8));
        assert_eq!(judgment.findings[0].severity, Severity::Medium);
        assert_eq!(judgment.findings[0].id, "tone.0");
    }

    #[test]
    fn test_parse_judgment_without_json() {
        assert!(parse_judgment("No issues found.", "tone", Category::Quality).is_err());
    }
}
