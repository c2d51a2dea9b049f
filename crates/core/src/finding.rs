//! Findings - individual issues reported by validators.

use serde::{Deserialize, Serialize};

/// Normalized five-level severity scale.
///
/// Variants are declared from least to most severe so that `Ord` follows
/// severity (`Severity::Critical > Severity::High`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, never affects status
    Info,
    /// Minor issue
    Low,
    /// Should be fixed before publication
    Medium,
    /// Must be fixed; too many fail the run
    High,
    /// Fails the run on its own
    Critical,
}

impl Severity {
    /// All severities, most severe first.
    pub const DESCENDING: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ];

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "info" => Ok(Severity::Info),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Finding category. Aggregation weights are configured per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    BusinessRule,
    Security,
    Documentation,
    Quality,
    Compliance,
    Style,
    Accuracy,
}

impl Category {
    /// All categories.
    pub const ALL: [Category; 7] = [
        Category::BusinessRule,
        Category::Security,
        Category::Documentation,
        Category::Quality,
        Category::Compliance,
        Category::Style,
        Category::Accuracy,
    ];

    /// Kebab-case name, as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::BusinessRule => "business-rule",
            Category::Security => "security",
            Category::Documentation => "documentation",
            Category::Quality => "quality",
            Category::Compliance => "compliance",
            Category::Style => "style",
            Category::Accuracy => "accuracy",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .find(|c| c.as_str() == s.trim())
            .copied()
            .ok_or_else(|| format!("unknown category '{}'", s))
    }
}

/// Where a finding was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// File path, relative to the work item root where possible
    pub file: String,

    /// 1-based line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,

    /// 1-based column
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,

    /// Free-form region (section title, page range, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl Location {
    /// Location pointing at a whole file.
    pub fn file(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
            column: None,
            region: None,
        }
    }

    /// Location pointing at a line/column in a file.
    pub fn at(file: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            file: file.into(),
            line: Some(line),
            column: Some(column),
            region: None,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file)?;
        if let Some(line) = self.line {
            write!(f, ":{}", line)?;
            if let Some(column) = self.column {
                write!(f, ":{}", column)?;
            }
        }
        if let Some(region) = &self.region {
            write!(f, " ({})", region)?;
        }
        Ok(())
    }
}

/// One issue reported by exactly one validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Identifier, unique within the reporting validator's result
    pub id: String,

    /// Category
    pub category: Category,

    /// Normalized severity
    pub severity: Severity,

    /// Human-readable message
    pub message: String,

    /// Where it was observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,

    /// How to fix it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,

    /// Rule that produced it, if the validator is rule-based
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,

    /// The validator's own severity label, mapped onto `severity` during aggregation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_severity: Option<String>,
}

impl Finding {
    /// Create a new finding.
    pub fn new(
        id: impl Into<String>,
        category: Category,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            category,
            severity,
            message: message.into(),
            location: None,
            remediation: None,
            rule: None,
            native_severity: None,
        }
    }

    /// Set location.
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Set remediation text.
    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    /// Set originating rule.
    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    /// Set the validator-specific severity label.
    pub fn with_native_severity(mut self, label: impl Into<String>) -> Self {
        self.native_severity = Some(label.into());
        self
    }
}
