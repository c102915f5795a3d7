#![forbid(unsafe_code)]

//! Version-gated capabilities of the Claude Code CLI.
//!
//! The compatibility table is the only place where child-CLI version
//! knowledge lives; supporting a new release means adding a row. Versions
//! that match no row get a safe-mode adapter that optimistically advertises
//! modern features and lets runtime failures fall back.

use anyhow::Context as _;
use semver::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub stream_json: bool,
    pub resume: bool,
    pub rate_limit_exit_code: Option<i32>,
}

struct CompatRow {
    /// Inclusive semver bounds.
    min: &'static str,
    max: &'static str,
    caps: Capabilities,
}

const COMPAT_TABLE: &[CompatRow] = &[
    CompatRow {
        min: "2.0.0",
        max: "2.99.99",
        caps: Capabilities {
            stream_json: true,
            resume: true,
            rate_limit_exit_code: Some(75),
        },
    },
    CompatRow {
        min: "1.0.0",
        max: "1.99.99",
        caps: Capabilities {
            stream_json: false,
            resume: false,
            rate_limit_exit_code: None,
        },
    },
];

const SAFE_MODE_CAPS: Capabilities = Capabilities {
    stream_json: true,
    resume: true,
    rate_limit_exit_code: Some(75),
};

/// Everything needed to compose one child invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchSpec<'a> {
    pub prompt: &'a str,
    pub model: &'a str,
    pub session_id: &'a str,
    pub skip_permissions: bool,
    pub flags: &'a [String],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliAdapter {
    /// Version matched a compatibility table row.
    Known(Capabilities),
    /// Version unknown; try modern features optimistically.
    SafeMode,
}

impl CliAdapter {
    #[must_use]
    pub fn for_version(version: Option<&str>) -> Self {
        version
            .and_then(lookup)
            .map_or(Self::SafeMode, Self::Known)
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::Known(caps) => *caps,
            Self::SafeMode => SAFE_MODE_CAPS,
        }
    }

    #[must_use]
    pub fn supports_stream_json(&self) -> bool {
        self.capabilities().stream_json
    }

    #[must_use]
    pub fn supports_resume(&self) -> bool {
        self.capabilities().resume
    }

    #[must_use]
    pub fn rate_limit_exit_code(&self) -> Option<i32> {
        self.capabilities().rate_limit_exit_code
    }

    /// Builds the child argument list. The trailing `--` separator is
    /// mandatory so prompts beginning with `-` are not read as flags.
    #[must_use]
    pub fn build_args(&self, spec: &LaunchSpec<'_>) -> Vec<String> {
        let caps = self.capabilities();
        let mut args = vec!["--print".to_owned()];

        if caps.stream_json {
            // The CLI requires --verbose with stream-json in print mode.
            args.push("--verbose".to_owned());
            args.push("--output-format".to_owned());
            args.push("stream-json".to_owned());
        }

        if caps.resume && !spec.session_id.is_empty() {
            args.push("--resume".to_owned());
            args.push(spec.session_id.to_owned());
        }

        if !spec.model.is_empty() {
            args.push("--model".to_owned());
            args.push(spec.model.to_owned());
        }

        if spec.skip_permissions {
            args.push("--dangerously-skip-permissions".to_owned());
        }

        args.extend(spec.flags.iter().cloned());
        args.push("--".to_owned());
        args.push(spec.prompt.to_owned());
        args
    }
}

/// Runs `<executable> --version` and extracts a semver-looking token.
pub fn detect_version(executable: &str) -> anyhow::Result<String> {
    let out = std::process::Command::new(executable)
        .arg("--version")
        .output()
        .with_context(|| format!("failed to run {executable} --version"))?;
    if !out.status.success() {
        anyhow::bail!(
            "{executable} --version exited with {:?}: {}",
            out.status.code(),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    parse_version_output(&String::from_utf8_lossy(&out.stdout))
}

fn parse_version_output(output: &str) -> anyhow::Result<String> {
    for field in output.split_whitespace() {
        let candidate = field.strip_prefix('v').unwrap_or(field);
        if candidate.starts_with(|c: char| c.is_ascii_digit()) && candidate.contains('.') {
            return Ok(candidate.to_owned());
        }
    }
    anyhow::bail!("no version found in output: {output:?}")
}

fn lookup(version: &str) -> Option<Capabilities> {
    let v = normalize(version)?;
    COMPAT_TABLE
        .iter()
        .find(|row| {
            let min = normalize(row.min).unwrap_or_else(|| Version::new(0, 0, 0));
            let max = normalize(row.max).unwrap_or_else(|| Version::new(0, 0, 0));
            v >= min && v <= max
        })
        .map(|row| row.caps)
}

/// Normalizes a loose version string for comparison: leading `v`, pre-release
/// suffixes, and build metadata are stripped; missing components default to
/// zero.
fn normalize(version: &str) -> Option<Version> {
    let v = version.trim().strip_prefix('v').unwrap_or_else(|| version.trim());
    let core = v.split(['-', '+']).next().unwrap_or(v);

    let mut parts = [0u64; 3];
    for (i, field) in core.split('.').take(3).enumerate() {
        parts[i] = field.parse().ok()?;
    }
    Some(Version::new(parts[0], parts[1], parts[2]))
}
