use regex::{Regex, RegexBuilder};

/// Outcome of inspecting one iteration's combined log against rc and the
/// three failure-signal regex families. Transient-error counting and the
/// rc==124/complete-signal interaction are mode-specific and stay in the
/// caller (the classic and zip-chain loops differ on exactly that point),
/// so this stays a plain classification rather than a final stop/status pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    RateLimit,
    ContextLimit,
    Transient,
    Timeout,
    AssistantFailed(i32),
    Complete,
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationStatus {
    InProgress,
    Done,
    Failed,
    StoppedRateLimit,
    StoppedContextLimit,
    StoppedIterationCap,
}

impl IterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationStatus::InProgress => "in_progress",
            IterationStatus::Done => "done",
            IterationStatus::Failed => "failed",
            IterationStatus::StoppedRateLimit => "stopped_rate_limit",
            IterationStatus::StoppedContextLimit => "stopped_context_limit",
            IterationStatus::StoppedIterationCap => "stopped_iteration_cap",
        }
    }
}

/// Precompiled regex families for the three failure signals, case-insensitive.
pub struct Classifier {
    rate_limit: Regex,
    context_limit: Regex,
    transient: Regex,
}

impl Classifier {
    pub fn new() -> Self {
        let build = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("static regex is valid")
        };
        Self {
            rate_limit: build(r"rate.?limit|429|too many requests|retry after|quota exceeded"),
            context_limit: build(
                r"context length|maximum context|prompt too long|input too long|too many tokens|token limit|context window",
            ),
            transient: build(
                r"status code 502|status code 503|status code 504|bad gateway|gateway timeout|service unavailable|temporarily unavailable|upstream",
            ),
        }
    }

    pub fn is_rate_limited(&self, text: &str) -> bool {
        self.rate_limit.is_match(text)
    }

    pub fn is_context_limited(&self, text: &str) -> bool {
        self.context_limit.is_match(text)
    }

    pub fn is_transient(&self, text: &str) -> bool {
        self.transient.is_match(text)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Classifies one iteration's outcome. Mirrors the precedence chain shared by
/// both modes: rate-limit, then context-limit, then transient, then any
/// other nonzero non-timeout rc, then (only once none of those matched)
/// completion and in-progress. A bare rc==124 with no hard-stop signal in the
/// log is `Timeout` regardless of completion text — it is up to the caller
/// whether a timeout still counts a completion signal (zip-chain mode does;
/// classic mode does not).
pub fn classify(classifier: &Classifier, log_text: &str, rc: i32, complete_signal: &str) -> Classification {
    if rc != 0 && classifier.is_rate_limited(log_text) {
        return Classification::RateLimit;
    }
    if rc != 0 && classifier.is_context_limited(log_text) {
        return Classification::ContextLimit;
    }
    if rc != 0 && classifier.is_transient(log_text) {
        return Classification::Transient;
    }
    if rc != 0 && rc != 124 {
        return Classification::AssistantFailed(rc);
    }
    if rc == 124 {
        return Classification::Timeout;
    }
    if !complete_signal.is_empty() && log_text.contains(complete_signal) {
        return Classification::Complete;
    }
    Classification::InProgress
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c() -> Classifier {
        Classifier::new()
    }

    #[test]
    fn rate_limit_wins_over_everything_when_rc_nonzero() {
        let text = "429 Too Many Requests, also status code 503, RALPH_COMPLETE";
        assert_eq!(
            classify(&c(), text, 1, "RALPH_COMPLETE"),
            Classification::RateLimit
        );
    }

    #[test]
    fn rate_limit_variants() {
        for text in [
            "Rate limit exceeded",
            "ratelimit hit",
            "HTTP 429",
            "too many requests",
            "please retry after 30s",
            "quota exceeded for today",
        ] {
            assert_eq!(classify(&c(), text, 1, "X"), Classification::RateLimit, "{text}");
        }
    }

    #[test]
    fn context_limit_detected_when_no_rate_limit() {
        let text = "Error: maximum context length exceeded";
        assert_eq!(
            classify(&c(), text, 1, "RALPH_COMPLETE"),
            Classification::ContextLimit
        );
    }

    #[test]
    fn transient_detected_and_distinct_from_failure() {
        for text in [
            "status code 502",
            "status code 503",
            "status code 504",
            "Bad Gateway",
            "Gateway Timeout",
            "Service Unavailable",
            "temporarily unavailable, try later",
            "upstream connect error",
        ] {
            assert_eq!(classify(&c(), text, 1, "X"), Classification::Transient, "{text}");
        }
    }

    #[test]
    fn other_nonzero_rc_is_assistant_failed() {
        assert_eq!(
            classify(&c(), "some ordinary crash", 2, "RALPH_COMPLETE"),
            Classification::AssistantFailed(2)
        );
    }

    #[test]
    fn timeout_without_other_signal_is_timeout() {
        assert_eq!(
            classify(&c(), "still working...", 124, "RALPH_COMPLETE"),
            Classification::Timeout
        );
    }

    #[test]
    fn rate_limit_signal_still_wins_on_timeout_rc() {
        assert_eq!(
            classify(&c(), "429 too many requests", 124, "RALPH_COMPLETE"),
            Classification::RateLimit
        );
    }

    #[test]
    fn complete_signal_detected_on_success_rc() {
        assert_eq!(
            classify(&c(), "work done\nRALPH_COMPLETE\n", 0, "RALPH_COMPLETE"),
            Classification::Complete
        );
    }

    #[test]
    fn in_progress_on_success_rc_without_signal() {
        assert_eq!(
            classify(&c(), "work in progress", 0, "RALPH_COMPLETE"),
            Classification::InProgress
        );
    }

    #[test]
    fn timeout_takes_precedence_over_complete_signal_detection_here() {
        // classify() itself reports Timeout for rc==124 regardless of the
        // completion text; whether that still "counts" as done is a
        // mode-specific decision left to the caller.
        assert_eq!(
            classify(&c(), "RALPH_COMPLETE", 124, "RALPH_COMPLETE"),
            Classification::Timeout
        );
    }

    #[test]
    fn iteration_status_as_str_matches_contract_tokens() {
        assert_eq!(IterationStatus::InProgress.as_str(), "in_progress");
        assert_eq!(IterationStatus::Done.as_str(), "done");
        assert_eq!(IterationStatus::Failed.as_str(), "failed");
        assert_eq!(IterationStatus::StoppedRateLimit.as_str(), "stopped_rate_limit");
        assert_eq!(IterationStatus::StoppedContextLimit.as_str(), "stopped_context_limit");
        assert_eq!(IterationStatus::StoppedIterationCap.as_str(), "stopped_iteration_cap");
    }
}
