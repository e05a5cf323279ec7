//! Prompt construction for generation requests
//!
//! Each request is self-contained: task, optional repair diagnostic and the
//! repository context. The provider keeps no history between attempts.

use kiln_agent::file_block_instructions;
use kiln_core::Task;

const SYSTEM_PREAMBLE: &str = "You are an autonomous software engineer working inside an existing \
repository. You implement the requested change by rewriting whole files. You never explain, \
never ask questions and never produce anything except file blocks.";

/// Fixed system instruction for every generation request
pub fn system_prompt() -> String {
    format!("{}\n\n{}", SYSTEM_PREAMBLE, file_block_instructions())
}

/// User prompt for one attempt
pub fn build_user_prompt(task: &Task, context: &str, prior_failure: Option<&str>) -> String {
    let mut prompt = String::new();

    prompt.push_str("# TASK\n\n");
    prompt.push_str(&format!("**{}**\n\n", task.title.trim()));
    if let Some(description) = task.description.as_deref().filter(|d| !d.trim().is_empty()) {
        prompt.push_str(description.trim());
        prompt.push_str("\n\n");
    }

    if let Some(failure) = prior_failure {
        prompt.push_str("# PREVIOUS ATTEMPT FAILED\n\n");
        prompt.push_str("Your previous change did not pass verification. Fix this failure:\n\n");
        prompt.push_str("```\n");
        prompt.push_str(failure.trim());
        prompt.push_str("\n```\n\n");
    }

    prompt.push_str("# REPOSITORY CONTEXT\n\n");
    prompt.push_str(context);
    prompt.push_str("\n\n");

    prompt.push_str("# OBJECTIVE\n\n");
    if prior_failure.is_some() {
        prompt.push_str("1. Fix the failure shown above\n");
        prompt.push_str("2. Keep everything the task asks for working\n");
    } else {
        prompt.push_str("1. Implement the task completely\n");
        prompt.push_str("2. Add or update tests where the project has them\n");
    }
    prompt.push_str("3. Output only FILE blocks with complete file contents\n");

    prompt
}
