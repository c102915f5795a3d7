#![forbid(unsafe_code)]

//! Pattern lists used for rate-limit detection and prompt-wait hang
//! detection. Defaults are compiled in; user overrides extend the lists and
//! exclude lists remove default entries.

use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

const DEFAULT_MATCHERS_YAML: &str = include_str!("matchers.default.yaml");

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatchersConfig {
    pub rate_limit_patterns: Vec<String>,
    pub prompt_patterns: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_rate_limit_patterns: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_prompt_patterns: Vec<String>,
}

/// Loads the merged matcher configuration: embedded defaults, minus the user
/// exclude lists, plus user additions from `matchers_file` when it exists.
pub fn load_matchers(matchers_file: &Path) -> anyhow::Result<MatchersConfig> {
    let base: MatchersConfig =
        serde_yaml::from_str(DEFAULT_MATCHERS_YAML).context("parse default matchers")?;

    let data = match std::fs::read_to_string(matchers_file) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(base),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read {}", matchers_file.display()));
        }
    };

    let user: MatchersConfig = serde_yaml::from_str(&data)
        .with_context(|| format!("failed to parse {}", matchers_file.display()))?;

    Ok(merge(base, &user))
}

fn merge(base: MatchersConfig, user: &MatchersConfig) -> MatchersConfig {
    MatchersConfig {
        rate_limit_patterns: merge_list(
            base.rate_limit_patterns,
            &user.rate_limit_patterns,
            &user.exclude_rate_limit_patterns,
        ),
        prompt_patterns: merge_list(
            base.prompt_patterns,
            &user.prompt_patterns,
            &user.exclude_prompt_patterns,
        ),
        exclude_rate_limit_patterns: Vec::new(),
        exclude_prompt_patterns: Vec::new(),
    }
}

fn merge_list(base: Vec<String>, additions: &[String], exclude: &[String]) -> Vec<String> {
    let mut out: Vec<String> = base
        .into_iter()
        .filter(|p| !exclude.contains(p))
        .collect();
    for a in additions {
        if !out.contains(a) {
            out.push(a.clone());
        }
    }
    out
}
