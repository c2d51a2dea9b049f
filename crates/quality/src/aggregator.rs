//! Results aggregation: severity normalization, status, weighted score and
//! the human-review gate.
//!
//! Aggregation is a pure function of its inputs apart from the recorded
//! timestamp. Results are consumed in validator-id order and every map is
//! ordered, so the same input always yields the same output.

use stagegate_core::{
    AggregationConfig, Category, CategoryScore, ErrorPolicy, OverallStatus, ReviewContext,
    ReviewFinding, RunId, Severity, Summary, ValidationConfig, ValidationResult, ValidatorResult,
    WorkItem,
};
use std::collections::BTreeMap;

use crate::registry::ValidatorRegistry;
use crate::validator::ValidatorDescriptor;

/// Per-validator normalization inputs.
#[derive(Debug, Clone)]
struct Normalization {
    /// Declared native label mapping
    descriptor: ValidatorDescriptor,
    /// Forced severity from configuration
    severity_override: Option<Severity>,
}

/// Folds per-validator results into one [`ValidationResult`].
#[derive(Debug, Clone)]
pub struct ResultsAggregator {
    config: AggregationConfig,
    normalization: BTreeMap<String, Normalization>,
}

impl ResultsAggregator {
    /// Aggregator without per-validator severity mappings.
    pub fn new(config: AggregationConfig) -> Self {
        Self {
            config,
            normalization: BTreeMap::new(),
        }
    }

    /// Aggregator using the registry's severity mappings and the
    /// configuration's severity overrides.
    pub fn from_config(config: &ValidationConfig, registry: &ValidatorRegistry) -> Self {
        let mut normalization = BTreeMap::new();
        for desc in registry.descriptors() {
            normalization.insert(
                desc.id.clone(),
                Normalization {
                    descriptor: desc.clone(),
                    severity_override: config.validators.get(&desc.id).and_then(|s| s.severity),
                },
            );
        }
        Self {
            config: config.aggregation.clone(),
            normalization,
        }
    }

    /// Aggregation settings in use.
    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Build the run result.
    pub fn aggregate(
        &self,
        item: &WorkItem,
        run_id: RunId,
        results: BTreeMap<String, ValidatorResult>,
    ) -> ValidationResult {
        let results: BTreeMap<String, ValidatorResult> = results
            .into_iter()
            .map(|(id, r)| {
                let r = self.normalize(&id, r);
                (id, r)
            })
            .collect();

        let summary_counts = count_findings(&results);
        let overall_status = self.overall_status(&summary_counts.by_severity);
        let category_scores = self.category_scores(&results);
        let quality_score = weighted_score(&category_scores);

        let errored: Vec<&str> = results
            .iter()
            .filter(|(_, r)| r.is_error())
            .map(|(id, _)| id.as_str())
            .collect();

        let mut reasons = Vec::new();
        if quality_score < self.config.human_review_threshold {
            reasons.push(format!(
                "quality score {:.1} is below the review threshold {:.1}",
                quality_score, self.config.human_review_threshold
            ));
        }
        if overall_status == OverallStatus::Fail {
            reasons.push("overall status is fail".to_string());
        }
        if self.config.review_on_validator_error && !errored.is_empty() {
            reasons.push(format!(
                "validators did not complete: {}",
                errored.join(", ")
            ));
        }
        let human_review = !reasons.is_empty();

        let review = human_review.then(|| ReviewContext {
            reasons,
            category_scores: category_scores
                .iter()
                .map(|(c, s)| (*c, s.score))
                .collect(),
            findings: review_findings(&results),
            comparisons: item.comparisons.clone(),
        });

        let summary = Summary {
            total_findings: summary_counts.total,
            findings_by_severity: summary_counts.by_severity,
            findings_by_validator: summary_counts.by_validator,
            overall_status,
            quality_score,
            human_review,
            validator_errors: errored.len(),
        };

        tracing::info!(
            work_item = %item.id,
            run_id = %run_id,
            "Aggregated {} validators: score {:.1}, status {}, review {}",
            results.len(),
            summary.quality_score,
            summary.overall_status,
            summary.human_review
        );

        ValidationResult {
            run_id,
            work_item: item.id.clone(),
            revision: item.revision,
            timestamp: chrono::Utc::now(),
            results,
            summary,
            category_scores,
            review,
        }
    }

    /// Map native labels onto the common scale and apply configured
    /// overrides. Findings describing a validator's own failure are left
    /// at `info`.
    fn normalize(&self, id: &str, mut result: ValidatorResult) -> ValidatorResult {
        let Some(norm) = self.normalization.get(id) else {
            return result;
        };
        if result.is_error() {
            return result;
        }
        for finding in &mut result.findings {
            if let Some(label) = &finding.native_severity {
                if let Some(sev) = norm.descriptor.normalize(label) {
                    finding.severity = sev;
                }
            }
            if let Some(forced) = norm.severity_override {
                finding.severity = forced;
            }
        }
        result
    }

    fn overall_status(&self, by_severity: &BTreeMap<Severity, usize>) -> OverallStatus {
        let count = |s: Severity| by_severity.get(&s).copied().unwrap_or(0);
        let high = count(Severity::High);
        if count(Severity::Critical) > 0 || high > self.config.max_high_findings {
            OverallStatus::Fail
        } else if high > 0 || count(Severity::Medium) > 0 {
            OverallStatus::Warning
        } else {
            OverallStatus::Pass
        }
    }

    /// Sub-score of one validator: its own `score` metric when reported and
    /// finite, else `100 - Σ severity weights`, both clamped to [0, 100].
    pub fn sub_score(&self, result: &ValidatorResult) -> f64 {
        if let Some(score) = result.reported_score().filter(|s| s.is_finite()) {
            return score.clamp(0.0, 100.0);
        }
        let penalty: f64 = result
            .findings
            .iter()
            .map(|f| self.config.severity_weights.weight(f.severity))
            .sum();
        (100.0 - penalty).clamp(0.0, 100.0)
    }

    fn category_scores(
        &self,
        results: &BTreeMap<String, ValidatorResult>,
    ) -> BTreeMap<Category, CategoryScore> {
        let mut buckets: BTreeMap<Category, Vec<(&str, f64)>> = BTreeMap::new();
        for (id, result) in results {
            let score = if result.is_error() {
                match self.config.error_policy {
                    ErrorPolicy::Exclude => continue,
                    ErrorPolicy::Zero => 0.0,
                }
            } else {
                self.sub_score(result)
            };
            buckets
                .entry(result.category)
                .or_default()
                .push((id.as_str(), score));
        }

        let total_weight: f64 = buckets
            .keys()
            .map(|c| self.config.weights.get(c).copied().unwrap_or(0.0))
            .sum();

        buckets
            .into_iter()
            .map(|(category, entries)| {
                let weight = self.config.weights.get(&category).copied().unwrap_or_else(|| {
                    tracing::warn!("No weight configured for category {}", category);
                    0.0
                });
                let score =
                    entries.iter().map(|(_, s)| s).sum::<f64>() / entries.len() as f64;
                let effective_weight = if total_weight > 0.0 {
                    weight / total_weight
                } else {
                    0.0
                };
                (
                    category,
                    CategoryScore {
                        score,
                        weight,
                        effective_weight,
                        validators: entries.iter().map(|(id, _)| id.to_string()).collect(),
                    },
                )
            })
            .collect()
    }
}

fn weighted_score(categories: &BTreeMap<Category, CategoryScore>) -> f64 {
    categories
        .values()
        .map(|c| c.score * c.effective_weight)
        .sum::<f64>()
        .clamp(0.0, 100.0)
}

struct Counts {
    total: usize,
    by_severity: BTreeMap<Severity, usize>,
    by_validator: BTreeMap<String, usize>,
}

fn count_findings(results: &BTreeMap<String, ValidatorResult>) -> Counts {
    let mut by_severity: BTreeMap<Severity, usize> =
        Severity::DESCENDING.iter().map(|s| (*s, 0)).collect();
    let mut by_validator = BTreeMap::new();
    let mut total = 0;
    for (id, result) in results {
        by_validator.insert(id.clone(), result.findings.len());
        total += result.findings.len();
        for finding in &result.findings {
            *by_severity.entry(finding.severity).or_insert(0) += 1;
        }
    }
    Counts {
        total,
        by_severity,
        by_validator,
    }
}

/// All findings, most severe first; ties keep validator-id then report order.
fn review_findings(results: &BTreeMap<String, ValidatorResult>) -> Vec<ReviewFinding> {
    let mut findings: Vec<ReviewFinding> = results
        .iter()
        .flat_map(|(id, r)| {
            r.findings.iter().map(move |f| ReviewFinding {
                validator: id.clone(),
                finding: f.clone(),
            })
        })
        .collect();
    findings.sort_by(|a, b| b.finding.severity.cmp(&a.finding.severity));
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::finding;
    use stagegate_core::{Finding, ValidatorFailure, ValidatorStatus, WorkItemId};

    fn item() -> WorkItem {
        WorkItem::new(WorkItemId::new("book").unwrap(), "book.md")
    }

    fn equal_config() -> AggregationConfig {
        AggregationConfig::equal_weights(&[Category::Quality, Category::Style, Category::Security])
    }

    fn scenario_results() -> BTreeMap<String, ValidatorResult> {
        let mut results = BTreeMap::new();
        results.insert(
            "grammar".to_string(),
            ValidatorResult::from_findings("grammar", Category::Quality, vec![]).with_score(95.0),
        );
        results.insert(
            "style".to_string(),
            ValidatorResult::from_findings(
                "style",
                Category::Style,
                vec![finding("passive-voice", Severity::Medium)],
            )
            .with_score(70.0),
        );
        results.insert(
            "scanner".to_string(),
            ValidatorResult::error(
                "scanner",
                Category::Security,
                ValidatorFailure::new("crash", "simulated crash"),
            ),
        );
        results
    }

    fn strip_timestamp(mut r: ValidationResult) -> ValidationResult {
        r.timestamp = chrono::DateTime::<chrono::Utc>::MIN_UTC;
        r
    }

    #[test]
    fn test_three_validator_scenario() {
        let aggregator = ResultsAggregator::new(AggregationConfig {
            human_review_threshold: 80.0,
            ..equal_config()
        });
        let result = aggregator.aggregate(&item(), RunId::new(), scenario_results());

        assert!((result.summary.quality_score - 82.5).abs() < 1e-9);
        assert_eq!(result.summary.overall_status, OverallStatus::Warning);
        assert!(result.summary.human_review);
        assert_eq!(result.summary.validator_errors, 1);
        assert!(!result.category_scores.contains_key(&Category::Security));

        // The crash is visible as a finding.
        let review = result.review.as_ref().unwrap();
        assert!(review
            .findings
            .iter()
            .any(|f| f.validator == "scanner" && f.finding.severity == Severity::Info));
        assert_eq!(review.findings[0].finding.severity, Severity::Medium);
    }

    #[test]
    fn test_zero_policy_counts_errors() {
        let aggregator = ResultsAggregator::new(AggregationConfig {
            error_policy: ErrorPolicy::Zero,
            ..equal_config()
        });
        let result = aggregator.aggregate(&item(), RunId::new(), scenario_results());
        assert!((result.summary.quality_score - 55.0).abs() < 1e-6);
        assert_eq!(result.category_scores[&Category::Security].score, 0.0);
    }

    #[test]
    fn test_error_does_not_force_review_when_disabled() {
        let aggregator = ResultsAggregator::new(AggregationConfig {
            review_on_validator_error: false,
            ..equal_config()
        });
        let result = aggregator.aggregate(&item(), RunId::new(), scenario_results());
        assert!(!result.summary.human_review);
        assert!(result.review.is_none());
    }

    #[test]
    fn test_aggregation_is_deterministic() {
        let aggregator = ResultsAggregator::new(equal_config());
        let run_id = RunId::new();
        let a = aggregator.aggregate(&item(), run_id, scenario_results());
        let b = aggregator.aggregate(&item(), run_id, scenario_results());
        assert_eq!(strip_timestamp(a), strip_timestamp(b));
    }

    #[test]
    fn test_derived_sub_score() {
        let aggregator = ResultsAggregator::new(equal_config());
        let result = ValidatorResult::from_findings(
            "v",
            Category::Quality,
            vec![
                finding("a", Severity::High),
                finding("b", Severity::Medium),
                finding("c", Severity::Low),
                finding("d", Severity::Info),
            ],
        );
        assert_eq!(aggregator.sub_score(&result), 67.0);

        let crushed = ValidatorResult::from_findings(
            "v",
            Category::Quality,
            vec![finding("a", Severity::Critical); 3],
        );
        assert_eq!(aggregator.sub_score(&crushed), 0.0);

        let odd = ValidatorResult::from_findings("v", Category::Quality, vec![]).with_score(140.0);
        assert_eq!(aggregator.sub_score(&odd), 100.0);
    }

    #[test]
    fn test_status_thresholds() {
        let aggregator = ResultsAggregator::new(AggregationConfig {
            max_high_findings: 1,
            ..AggregationConfig::equal_weights(&[Category::Quality])
        });
        let run = |findings: Vec<Finding>| {
            let mut results = BTreeMap::new();
            results.insert(
                "v".to_string(),
                ValidatorResult::from_findings("v", Category::Quality, findings),
            );
            aggregator
                .aggregate(&item(), RunId::new(), results)
                .summary
                .overall_status
        };

        assert_eq!(run(vec![finding("i", Severity::Info)]), OverallStatus::Pass);
        assert_eq!(run(vec![finding("h", Severity::High)]), OverallStatus::Warning);
        assert_eq!(
            run(vec![finding("h1", Severity::High), finding("h2", Severity::High)]),
            OverallStatus::Fail
        );
        assert_eq!(run(vec![finding("c", Severity::Critical)]), OverallStatus::Fail);
    }

    #[test]
    fn test_lower_threshold_never_adds_reviews() {
        let mut flagged = Vec::new();
        for threshold in [90.0, 80.0, 60.0, 0.0] {
            let aggregator = ResultsAggregator::new(AggregationConfig {
                human_review_threshold: threshold,
                review_on_validator_error: false,
                ..equal_config()
            });
            let result = aggregator.aggregate(&item(), RunId::new(), scenario_results());
            flagged.push(result.summary.human_review);
        }
        assert_eq!(flagged, vec![true, false, false, false]);
    }

    #[test]
    fn test_native_severity_mapped_and_override() {
        use crate::testing::{Behavior, FakeValidator};

        let mut registry = ValidatorRegistry::new();
        let lint = FakeValidator::new(
            "lint",
            Category::Quality,
            Behavior::Return(ValidatorResult::from_findings("lint", Category::Quality, vec![])),
        )
        .with_descriptor(|d| d.map_severity("blocker", Severity::Critical));
        registry.register(lint).unwrap();

        let config = ValidationConfig::from_yaml_str(
            "validators:\n  lint: {}\naggregation:\n  weights:\n    quality: 1.0\n",
        )
        .unwrap();
        let aggregator = ResultsAggregator::from_config(&config, &registry);

        let native = finding("n", Severity::Info).with_native_severity("BLOCKER");
        let mut results = BTreeMap::new();
        results.insert(
            "lint".to_string(),
            ValidatorResult::from_findings("lint", Category::Quality, vec![native])
                .with_status(ValidatorStatus::Success),
        );
        let result = aggregator.aggregate(&item(), RunId::new(), results);
        assert_eq!(result.results["lint"].findings[0].severity, Severity::Critical);
        assert_eq!(result.summary.overall_status, OverallStatus::Fail);

        let config = ValidationConfig::from_yaml_str(
            "validators:\n  lint:\n    severity: low\naggregation:\n  weights:\n    quality: 1.0\n",
        )
        .unwrap();
        let aggregator = ResultsAggregator::from_config(&config, &registry);
        let mut results = BTreeMap::new();
        results.insert(
            "lint".to_string(),
            ValidatorResult::from_findings("lint", Category::Quality, vec![finding("h", Severity::High)]),
        );
        let result = aggregator.aggregate(&item(), RunId::new(), results);
        assert_eq!(result.results["lint"].findings[0].severity, Severity::Low);
        assert_eq!(result.summary.overall_status, OverallStatus::Pass);
    }
}
