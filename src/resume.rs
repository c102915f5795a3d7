#![forbid(unsafe_code)]

//! Continuation strategy for retried attempts.

/// How a previously interrupted session should be continued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStrategy {
    /// Pass `--resume <session-id>`; the child reconstructs its own context.
    Native,
    /// Re-send the prompt wrapped with context from the interrupted attempt.
    RePrompt,
}

/// Native resume is preferred whenever the child supports it and a session ID
/// was captured; the re-prompt path guarantees forward progress otherwise.
#[must_use]
pub fn determine_strategy(has_session_id: bool, supports_resume: bool) -> ResumeStrategy {
    if has_session_id && supports_resume {
        ResumeStrategy::Native
    } else {
        ResumeStrategy::RePrompt
    }
}

/// Wraps the original prompt with a preamble describing the interrupted
/// attempt. At most the last 20 output lines are included.
#[must_use]
pub fn build_resume_prompt(attempt: i64, last_messages: &[String], original_prompt: &str) -> String {
    let start = last_messages.len().saturating_sub(20);
    let last_output = last_messages[start..].join("\n");

    format!(
        "[RESUMED — attempt {attempt}. Previous session expired.\n\
         Last output before interruption: {last_output}.\n\
         Continue from where you left off. Do not redo completed work.]\n\n\
         Original task:\n{original_prompt}"
    )
}
