//! Human review packets.
//!
//! When the gate escalates, the pipeline halts and writes a packet with
//! everything a reviewer needs: scores, findings, comparison artifacts and
//! the commands that record a decision and continue.

use stagegate_core::{Stage, ValidationResult};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Review request for one stage's validation.
#[derive(Debug, Clone, Copy)]
pub struct ReviewPacket<'a> {
    /// Stage awaiting review
    pub stage: Stage,
    /// The validation that asked for review
    pub result: &'a ValidationResult,
}

impl<'a> ReviewPacket<'a> {
    /// Create a packet.
    pub fn new(stage: Stage, result: &'a ValidationResult) -> Self {
        Self { stage, result }
    }

    /// File name of the packet.
    pub fn file_name(&self) -> String {
        format!("{}-{}.md", self.stage, self.result.run_id)
    }

    /// Render as markdown.
    pub fn render(&self) -> String {
        let r = self.result;
        let id = &r.work_item;
        let mut out = String::new();

        let _ = writeln!(out, "# Review: {} / {}", id, self.stage);
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Quality score **{:.1}**, status **{}**, {} finding(s). Run `{}` at {}.",
            r.summary.quality_score,
            r.summary.overall_status,
            r.summary.total_findings,
            r.run_id,
            r.timestamp.to_rfc3339()
        );
        let _ = writeln!(out);

        if let Some(review) = &r.review {
            let _ = writeln!(out, "## Why review was requested");
            let _ = writeln!(out);
            for reason in &review.reasons {
                let _ = writeln!(out, "- {}", reason);
            }
            let _ = writeln!(out);
        }

        let _ = writeln!(out, "## Category scores");
        let _ = writeln!(out);
        for (category, score) in &r.category_scores {
            let _ = writeln!(
                out,
                "- {}: {:.1} (weight {:.2})",
                category, score.score, score.effective_weight
            );
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "## Findings");
        let _ = writeln!(out);
        match &r.review {
            Some(review) if !review.findings.is_empty() => {
                for rf in &review.findings {
                    let f = &rf.finding;
                    let _ = write!(out, "- **{}** `{}` ({}): {}", f.severity, f.id, rf.validator, f.message);
                    if let Some(loc) = &f.location {
                        let _ = write!(out, " at {}", loc);
                    }
                    let _ = writeln!(out);
                    if let Some(fix) = &f.remediation {
                        let _ = writeln!(out, "  - Fix: {}", fix);
                    }
                }
            }
            _ => {
                let _ = writeln!(out, "None.");
            }
        }
        let _ = writeln!(out);

        if let Some(review) = r.review.as_ref().filter(|rv| !rv.comparisons.is_empty()) {
            let _ = writeln!(out, "## Original vs. final");
            let _ = writeln!(out);
            for c in &review.comparisons {
                let _ = writeln!(
                    out,
                    "- {}: `{}` -> `{}`",
                    c.label,
                    c.original.display(),
                    c.revised.display()
                );
            }
            let _ = writeln!(out);
        }

        let _ = writeln!(out, "## Decide");
        let _ = writeln!(out);
        let _ = writeln!(out, "```sh");
        let _ = writeln!(
            out,
            "stagegate review {} --stage {} --approve --reviewer <name> --comment \"...\"",
            id, self.stage
        );
        let _ = writeln!(
            out,
            "stagegate review {} --stage {} --reject --reviewer <name> --comment \"...\"",
            id, self.stage
        );
        if let Some(next) = self.stage.next() {
            let _ = writeln!(
                out,
                "# after approval\nstagegate resume {} --from-stage {} --config <file>",
                id, next
            );
        }
        let _ = writeln!(out, "```");
        out
    }

    /// Write the packet into `dir` and return its path.
    pub async fn write(&self, dir: &Path) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(self.file_name());
        tokio::fs::write(&path, self.render()).await?;
        tracing::info!(
            work_item = %self.result.work_item,
            stage = %self.stage,
            "Review packet written to {}",
            path.display()
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ResultsAggregator;
    use crate::testing::finding;
    use stagegate_core::{
        AggregationConfig, Category, ComparisonArtifact, RunId, Severity, ValidatorResult,
        WorkItem, WorkItemId,
    };
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn escalated() -> ValidationResult {
        let aggregator =
            ResultsAggregator::new(AggregationConfig::equal_weights(&[Category::Quality]));
        let mut results = BTreeMap::new();
        results.insert(
            "tone".to_string(),
            ValidatorResult::from_findings(
                "tone",
                Category::Quality,
                vec![finding("abrupt", Severity::Medium).with_remediation("add a closing paragraph")],
            )
            .with_score(55.0),
        );
        let item = WorkItem::new(WorkItemId::new("book").unwrap(), "book.md").with_comparison(
            ComparisonArtifact {
                label: "chapter 1".to_string(),
                original: "draft/ch1.md".into(),
                revised: "final/ch1.md".into(),
            },
        );
        aggregator.aggregate(&item, RunId::new(), results)
    }

    #[test]
    fn test_render_has_context_and_commands() {
        let result = escalated();
        let text = ReviewPacket::new(Stage::ContentFinalization, &result).render();
        assert!(text.contains("# Review: book / content-finalization"));
        assert!(text.contains("Quality score **55.0**"));
        assert!(text.contains("add a closing paragraph"));
        assert!(text.contains("chapter 1"));
        assert!(text.contains("stagegate review book --stage content-finalization --approve"));
        assert!(text.contains("--from-stage intermediate-conversion"));
    }

    #[test]
    fn test_last_stage_has_no_resume_hint() {
        let result = escalated();
        let text = ReviewPacket::new(Stage::ArtifactGeneration, &result).render();
        assert!(!text.contains("stagegate resume"));
    }

    #[tokio::test]
    async fn test_write() {
        let dir = TempDir::new().unwrap();
        let result = escalated();
        let packet = ReviewPacket::new(Stage::MetadataGeneration, &result);
        let path = packet.write(dir.path()).await.unwrap();
        assert!(path.starts_with(dir.path()));
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, packet.render());
    }
}
