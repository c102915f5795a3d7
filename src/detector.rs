#![forbid(unsafe_code)]

//! Layered classification of a child invocation's outcome.
//!
//! Layers, in priority order: exit code 0, the adapter's rate-limit exit
//! code, stderr pattern match, stdout pattern match (lower confidence), and
//! finally plain failure. A missing exit status (the child died to a signal
//! before reporting one) classifies as [`DetectionKind::Unknown`] unless a
//! pattern matches.

use regex::Regex;
use time::OffsetDateTime;

use crate::timeparse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionKind {
    Unknown,
    Completed,
    RateLimited,
    Failed,
}

impl std::fmt::Display for DetectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::RateLimited => "rate_limited",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub kind: DetectionKind,
    /// Set when a reset time could be extracted from the output.
    pub reset_at: Option<OffsetDateTime>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Detector {
    patterns: Vec<String>,
    rate_limit_exit_code: Option<i32>,
    reset_time_re: Regex,
}

impl Detector {
    /// Builds a detector from case-insensitive substring patterns and the
    /// adapter-supplied rate-limit exit code (`None` when the child CLI has
    /// no dedicated code).
    pub fn new(patterns: Vec<String>, rate_limit_exit_code: Option<i32>) -> anyhow::Result<Self> {
        let reset_time_re = Regex::new(r"(?i)(?:will\s+)?reset\s+(?:at\s+)?(.+?)(?:\.|$)")?;
        Ok(Self {
            patterns,
            rate_limit_exit_code,
            reset_time_re,
        })
    }

    #[must_use]
    pub fn detect(&self, exit_code: Option<i32>, stdout: &str, stderr: &str) -> Detection {
        if exit_code == Some(0) {
            return Detection {
                kind: DetectionKind::Completed,
                reset_at: None,
                reason: "exit code 0".to_owned(),
            };
        }

        if let Some(rl_code) = self.rate_limit_exit_code
            && exit_code == Some(rl_code)
        {
            return Detection {
                kind: DetectionKind::RateLimited,
                reset_at: self.extract_reset_time(&format!("{stderr} {stdout}")),
                reason: "exit code matches rate limit code".to_owned(),
            };
        }

        if let Some(pattern) = self.match_patterns(stderr) {
            return Detection {
                kind: DetectionKind::RateLimited,
                reset_at: self.extract_reset_time(&format!("{stderr} {stdout}")),
                reason: format!("stderr matched pattern: {pattern}"),
            };
        }

        if let Some(pattern) = self.match_patterns(stdout) {
            return Detection {
                kind: DetectionKind::RateLimited,
                reset_at: self.extract_reset_time(stdout),
                reason: format!("stdout matched pattern: {pattern}"),
            };
        }

        match exit_code {
            Some(code) => Detection {
                kind: DetectionKind::Failed,
                reset_at: None,
                reason: format!("exit code {code} with no rate limit indicators"),
            },
            None => Detection {
                kind: DetectionKind::Unknown,
                reset_at: None,
                reason: "child terminated without an exit status".to_owned(),
            },
        }
    }

    fn match_patterns(&self, text: &str) -> Option<&str> {
        let lower = text.to_lowercase();
        self.patterns
            .iter()
            .find(|p| lower.contains(&p.to_lowercase()))
            .map(String::as_str)
    }

    fn extract_reset_time(&self, text: &str) -> Option<OffsetDateTime> {
        let caps = self.reset_time_re.captures(text)?;
        let time_str = caps.get(1)?.as_str().trim();
        if time_str.is_empty() {
            return None;
        }
        timeparse::parse_reset_time(time_str).ok()
    }
}
