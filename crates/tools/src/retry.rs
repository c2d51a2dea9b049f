//! Retry policy and argument templating.

use std::collections::BTreeMap;
use std::time::Duration;

/// Exponential backoff: attempt `n` (1-based retry) waits
/// `base * 2^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// First delay
    pub base: Duration,

    /// Delay ceiling
    pub max: Duration,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            base,
            max,
        }
    }

    /// No retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(retry - 1);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Whether another attempt is allowed after `attempts` attempts.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }
}

/// Replace `{name}` placeholders in each argument.
///
/// Unknown placeholders are left as they are.
pub fn substitute(args: &[String], vars: &BTreeMap<&str, String>) -> Vec<String> {
    args.iter()
        .map(|arg| {
            let mut out = arg.clone();
            for (name, value) in vars {
                out = out.replace(&format!("{{{}}}", name), value);
            }
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500));
        assert_eq!(policy.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_allows() {
        let policy = RetryPolicy::new(2, Duration::ZERO, Duration::ZERO);
        assert!(policy.allows(1));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(!RetryPolicy::none().allows(1));
    }

    #[test]
    fn test_substitute() {
        let mut vars = BTreeMap::new();
        vars.insert("input", "book.md".to_string());
        vars.insert("output", "out/book.tex".to_string());
        let args = vec![
            "{input}".to_string(),
            "-o".to_string(),
            "{output}".to_string(),
            "{unknown}".to_string(),
        ];
        assert_eq!(
            substitute(&args, &vars),
            vec!["book.md", "-o", "out/book.tex", "{unknown}"]
        );
    }
}
