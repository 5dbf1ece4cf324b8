//! Attempt verdict derived from the validation gate and the applied batch.

use regex::Regex;

/// Facts gathered after applying one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// Captured lint output (exit code, stdout, stderr).
    pub lint_output: String,
    /// Captured test output (exit code, stdout, stderr).
    pub test_output: String,
    /// True if any command in this attempt's batch failed.
    pub cli_batch_failed: bool,
    /// True if the response carried a `<complete>` marker.
    pub complete_seen: bool,
}

/// Success, or the reason the attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail { reason: String },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Verdict::Pass => None,
            Verdict::Fail { reason } => Some(reason),
        }
    }
}

impl ValidationResult {
    /// Lint lines matching `warning_pattern`, in output order.
    pub fn lint_warnings<'a>(&'a self, warning_pattern: &Regex) -> Vec<&'a str> {
        self.lint_output
            .lines()
            .filter(|line| warning_pattern.is_match(line))
            .map(str::trim)
            .collect()
    }

    /// Pass only when no command failed, lint shows no warnings and completion was claimed.
    ///
    /// Every unmet condition contributes one sentence to the failure reason.
    pub fn verdict(&self, warning_pattern: &Regex) -> Verdict {
        let mut problems = Vec::new();
        if self.cli_batch_failed {
            problems.push("CLI execution failures detected.".to_string());
        }
        let warnings = self.lint_warnings(warning_pattern);
        if !warnings.is_empty() {
            problems.push(format!(
                "Lint warnings found, address them before proceeding: {}",
                warnings.join(" | ")
            ));
        }
        if !self.complete_seen {
            problems.push("Task not complete (no <complete> tag in response).".to_string());
        }
        if problems.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Fail {
                reason: problems.join("\n"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> Regex {
        Regex::new("Warning: (.*)").expect("regex")
    }

    fn result(lint: &str, cli_failed: bool, complete: bool) -> ValidationResult {
        ValidationResult {
            lint_output: lint.to_string(),
            test_output: String::new(),
            cli_batch_failed: cli_failed,
            complete_seen: complete,
        }
    }

    #[test]
    fn passes_when_all_conditions_hold() {
        let verdict = result("Lint exit code: 0\nall good", false, true).verdict(&pattern());
        assert_eq!(verdict, Verdict::Pass);
        assert!(verdict.is_pass());
        assert_eq!(verdict.reason(), None);
    }

    #[test]
    fn lint_warning_lines_fail_with_the_warning_text() {
        let lint = "src/app.js\n  Warning: 'x' is defined but never used\n";
        let verdict = result(lint, false, true).verdict(&pattern());
        let reason = verdict.reason().expect("fail");
        assert!(reason.contains("Lint warnings found"));
        assert!(reason.contains("'x' is defined but never used"));
    }

    #[test]
    fn missing_complete_fails_even_when_clean() {
        let verdict = result("", false, false).verdict(&pattern());
        assert_eq!(
            verdict.reason(),
            Some("Task not complete (no <complete> tag in response).")
        );
    }

    #[test]
    fn all_unmet_conditions_are_reported() {
        let verdict = result("Warning: a", true, false).verdict(&pattern());
        let reason = verdict.reason().expect("fail");
        assert_eq!(reason.lines().count(), 3);
        assert!(reason.starts_with("CLI execution failures detected."));
    }
}
