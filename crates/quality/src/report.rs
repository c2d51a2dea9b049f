//! Report rendering.
//!
//! Rendering is a pure function of the [`ValidationResult`]; a format that
//! fails to render does not stop the others.

use stagegate_core::{ReportFormat, Severity, ValidationResult, ValidatorStatus};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Rendering and writing errors.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// The result could not be rendered in this format
    #[error("failed to render {format} report: {reason}")]
    Render {
        /// Format
        format: ReportFormat,
        /// Cause
        reason: String,
    },

    /// Writing the report failed
    #[error("failed to write report {path}: {source}")]
    Io {
        /// Target path
        path: PathBuf,
        /// Cause
        #[source]
        source: std::io::Error,
    },
}

/// A rendered report.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    /// Format
    pub format: ReportFormat,
    /// Rendered content
    pub content: String,
}

impl Report {
    /// File name for this report, `<stem>.<ext>`.
    pub fn file_name(&self, stem: &str) -> String {
        format!("{}.{}", stem, self.format.extension())
    }

    /// Write the report into `dir`, creating it if needed.
    pub async fn write_to(&self, dir: &Path, stem: &str) -> Result<PathBuf, ReportError> {
        let path = dir.join(self.file_name(stem));
        let io = |source| ReportError::Io {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(dir).await.map_err(io)?;
        tokio::fs::write(&path, &self.content).await.map_err(io)?;
        tracing::debug!("Wrote {} report to {}", self.format, path.display());
        Ok(path)
    }
}

/// Reports from one `generate_all` call.
#[derive(Debug, Default)]
pub struct ReportBatch {
    /// Successfully rendered reports, in request order
    pub reports: Vec<Report>,
    /// Formats that failed
    pub errors: Vec<ReportError>,
}

impl ReportBatch {
    /// Write every report into `dir`. Write failures are collected.
    pub async fn write_all(&mut self, dir: &Path, stem: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for report in &self.reports {
            match report.write_to(dir, stem).await {
                Ok(path) => paths.push(path),
                Err(e) => self.errors.push(e),
            }
        }
        paths
    }
}

/// Stateless report renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportGenerator;

impl ReportGenerator {
    /// Create a generator.
    pub fn new() -> Self {
        Self
    }

    /// Formats this generator renders.
    pub fn supported_formats(&self) -> &'static [ReportFormat] {
        &ReportFormat::ALL
    }

    /// Render `result` in one format.
    pub fn generate(
        &self,
        result: &ValidationResult,
        format: ReportFormat,
    ) -> Result<Report, ReportError> {
        let content = match format {
            ReportFormat::Json => {
                serde_json::to_string_pretty(result).map_err(|e| ReportError::Render {
                    format,
                    reason: e.to_string(),
                })?
            }
            ReportFormat::Markdown => render_markdown(result),
            ReportFormat::Text => render_text(result),
            ReportFormat::Junit => render_junit(result),
        };
        Ok(Report { format, content })
    }

    /// Render `result` in each requested format.
    pub fn generate_all(&self, result: &ValidationResult, formats: &[ReportFormat]) -> ReportBatch {
        let mut batch = ReportBatch::default();
        for format in formats {
            match self.generate(result, *format) {
                Ok(report) => batch.reports.push(report),
                Err(e) => {
                    tracing::warn!("{}", e);
                    batch.errors.push(e);
                }
            }
        }
        batch
    }
}

fn render_markdown(result: &ValidationResult) -> String {
    let s = &result.summary;
    let mut out = String::new();
    let _ = writeln!(out, "# Validation Report: {}", result.work_item);
    let _ = writeln!(out);
    let _ = writeln!(out, "- **Run:** {}", result.run_id);
    let _ = writeln!(out, "- **Revision:** {}", result.revision);
    let _ = writeln!(out, "- **Timestamp:** {}", result.timestamp.to_rfc3339());
    let _ = writeln!(out, "- **Status:** {}", s.overall_status);
    let _ = writeln!(out, "- **Quality score:** {:.1}", s.quality_score);
    let _ = writeln!(
        out,
        "- **Human review:** {}",
        if s.human_review { "required" } else { "not required" }
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "## Categories");
    let _ = writeln!(out);
    let _ = writeln!(out, "| Category | Score | Weight | Effective weight | Validators |");
    let _ = writeln!(out, "|---|---|---|---|---|");
    for (category, score) in &result.category_scores {
        let _ = writeln!(
            out,
            "| {} | {:.1} | {:.3} | {:.3} | {} |",
            category,
            score.score,
            score.weight,
            score.effective_weight,
            score.validators.join(", ")
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Validators");
    let _ = writeln!(out);
    let _ = writeln!(out, "| Validator | Category | Status | Findings | Attempts |");
    let _ = writeln!(out, "|---|---|---|---|---|");
    for (id, r) in &result.results {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} |",
            id,
            r.category,
            r.status,
            r.findings.len(),
            r.attempts
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Findings ({})", s.total_findings);
    let _ = writeln!(out);
    for severity in Severity::DESCENDING {
        let findings: Vec<_> = result
            .findings()
            .filter(|(_, f)| f.severity == severity)
            .collect();
        if findings.is_empty() {
            continue;
        }
        let _ = writeln!(out, "### {} ({})", severity, findings.len());
        let _ = writeln!(out);
        for (validator, f) in findings {
            let _ = write!(out, "- `{}` [{}] {}", f.id, validator, f.message);
            if let Some(loc) = &f.location {
                let _ = write!(out, " ({})", loc);
            }
            let _ = writeln!(out);
            if let Some(fix) = &f.remediation {
                let _ = writeln!(out, "  - Fix: {}", fix);
            }
        }
        let _ = writeln!(out);
    }

    if let Some(review) = &result.review {
        let _ = writeln!(out, "## Review required");
        let _ = writeln!(out);
        for reason in &review.reasons {
            let _ = writeln!(out, "- {}", reason);
        }
    }
    out
}

fn render_text(result: &ValidationResult) -> String {
    let s = &result.summary;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} r{} run {}: {} (score {:.1}){}",
        result.work_item,
        result.revision,
        result.run_id,
        s.overall_status.to_string().to_uppercase(),
        s.quality_score,
        if s.human_review { ", human review required" } else { "" }
    );
    let counts: Vec<String> = Severity::DESCENDING
        .iter()
        .map(|sev| format!("{}={}", sev, s.findings_by_severity.get(sev).copied().unwrap_or(0)))
        .collect();
    let _ = writeln!(out, "findings: {} ({})", s.total_findings, counts.join(" "));
    for (id, r) in &result.results {
        let _ = writeln!(out, "  {:<24} {:<8} {}", id, r.status, r.findings.len());
        for f in &r.findings {
            let loc = f.location.as_ref().map(|l| format!(" {}", l)).unwrap_or_default();
            let _ = writeln!(out, "    [{}] {}{}: {}", f.severity, f.id, loc, f.message);
        }
    }
    out
}

fn render_junit(result: &ValidationResult) -> String {
    let count = |status: ValidatorStatus| {
        result
            .results
            .values()
            .filter(|r| r.status == status)
            .count()
    };
    let total_ms: u64 = result.results.values().map(|r| r.duration_ms).sum();

    let mut out = String::new();
    let _ = writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    let _ = writeln!(
        out,
        r#"<testsuite name="{}" tests="{}" failures="{}" errors="{}" time="{:.3}" timestamp="{}">"#,
        xml_escape(&format!("stagegate.{}", result.work_item)),
        result.results.len(),
        count(ValidatorStatus::Failure),
        count(ValidatorStatus::Error),
        total_ms as f64 / 1000.0,
        result.timestamp.to_rfc3339()
    );
    let _ = writeln!(out, "  <properties>");
    let _ = writeln!(
        out,
        r#"    <property name="quality_score" value="{:.2}"/>"#,
        result.summary.quality_score
    );
    let _ = writeln!(
        out,
        r#"    <property name="overall_status" value="{}"/>"#,
        result.summary.overall_status
    );
    let _ = writeln!(
        out,
        r#"    <property name="human_review" value="{}"/>"#,
        result.summary.human_review
    );
    let _ = writeln!(out, "  </properties>");

    for (id, r) in &result.results {
        let _ = writeln!(
            out,
            r#"  <testcase classname="{}" name="{}" time="{:.3}">"#,
            r.category,
            xml_escape(id),
            r.duration_ms as f64 / 1000.0
        );
        let details: String = r
            .findings
            .iter()
            .map(|f| format!("[{}] {}: {}\n", f.severity, f.id, f.message))
            .collect();
        match r.status {
            ValidatorStatus::Failure => {
                let _ = writeln!(
                    out,
                    r#"    <failure message="{} finding(s)">{}</failure>"#,
                    r.findings.len(),
                    xml_escape(&details)
                );
            }
            ValidatorStatus::Error => {
                let (code, message) = r
                    .failure
                    .as_ref()
                    .map(|f| (f.code.as_str(), f.message.as_str()))
                    .unwrap_or(("error", ""));
                let _ = writeln!(
                    out,
                    r#"    <error type="{}" message="{}"/>"#,
                    xml_escape(code),
                    xml_escape(message)
                );
            }
            ValidatorStatus::Warning | ValidatorStatus::Success => {
                if !details.is_empty() {
                    let _ = writeln!(out, "    <system-out>{}</system-out>", xml_escape(&details));
                }
            }
        }
        let _ = writeln!(out, "  </testcase>");
    }
    let _ = writeln!(out, "</testsuite>");
    out
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
