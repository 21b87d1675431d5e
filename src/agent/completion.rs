//! Detects the completion promise an agent writes to its own output when it
//! believes every eligible story now passes.

/// Scans only the tail of an iteration's output for the promise token, so a
/// malicious or confused agent can't plant the token early and have the
/// loop runner miss a real failure further down.
pub struct CompletionDetector {
    promise: String,
    max_lines_from_end: usize,
}

impl CompletionDetector {
    pub fn new(promise: impl Into<String>) -> Self {
        Self {
            promise: promise.into(),
            max_lines_from_end: 50,
        }
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines_from_end = max_lines;
        self
    }

    pub fn check(&self, output: &str) -> bool {
        self.tail(output).contains(&self.promise)
    }

    pub fn check_with_location(&self, output: &str) -> Option<CompletionMatch> {
        let lines: Vec<&str> = output.lines().collect();
        let start_line = lines.len().saturating_sub(self.max_lines_from_end);
        for (i, line) in lines[start_line..].iter().enumerate() {
            if let Some(col) = line.find(&self.promise) {
                return Some(CompletionMatch {
                    line: start_line + i + 1,
                    column: col + 1,
                    context: line.to_string(),
                });
            }
        }
        None
    }

    pub fn promise(&self) -> &str {
        &self.promise
    }

    fn tail(&self, output: &str) -> String {
        let lines: Vec<&str> = output.lines().collect();
        let start_line = lines.len().saturating_sub(self.max_lines_from_end);
        lines[start_line..].join("\n")
    }

    /// Reject promise tokens that would make prompt injection trivial: empty,
    /// too short to be distinctive, or containing shell/control metacharacters.
    pub fn validate_promise(promise: &str) -> Result<(), String> {
        if promise.is_empty() {
            return Err("promise cannot be empty".to_string());
        }
        if promise.len() < 5 {
            return Err("promise should be at least 5 characters".to_string());
        }
        const DANGEROUS: &[&str] = &["$(", "`", "&&", "||", ";", "|", "\n", "\r"];
        for pattern in DANGEROUS {
            if promise.contains(pattern) {
                return Err(format!("promise contains unsafe pattern: {pattern}"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CompletionMatch {
    pub line: usize,
    pub column: usize,
    pub context: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_promise_in_recent_output() {
        let detector = CompletionDetector::new("<promise>COMPLETE</promise>");
        let output = "working...\ndone\n<promise>COMPLETE</promise>\n";
        assert!(detector.check(output));
    }

    #[test]
    fn ignores_promise_outside_tail_window() {
        let detector = CompletionDetector::new("<promise>COMPLETE</promise>").with_max_lines(5);
        let mut output = "<promise>COMPLETE</promise>\n".to_string();
        for i in 0..10 {
            output.push_str(&format!("line {i}\n"));
        }
        assert!(!detector.check(&output));
    }

    #[test]
    fn validate_promise_rejects_injection_patterns() {
        assert!(CompletionDetector::validate_promise("<promise>DONE</promise>").is_ok());
        assert!(CompletionDetector::validate_promise("").is_err());
        assert!(CompletionDetector::validate_promise("hi").is_err());
        assert!(CompletionDetector::validate_promise("foo;bar;baz").is_err());
        assert!(CompletionDetector::validate_promise("$(rm -rf /)").is_err());
    }

    #[test]
    fn check_with_location_reports_one_indexed_position() {
        let detector = CompletionDetector::new("[[DONE]]");
        let output = "a\nb\nresult [[DONE]] ok\nc\n";
        let found = detector.check_with_location(output).unwrap();
        assert_eq!(found.line, 3);
        assert!(found.context.contains("[[DONE]]"));
    }
}
