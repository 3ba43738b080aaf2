//! Completion-phrase detection for worker steps.

/// Phrases that, inside any action's output, signal the task is done.
pub const ACTION_COMPLETION_PHRASES: &[&str] = &[
    "task completed",
    "implementation complete",
    "finished implementation",
];

/// Broader phrase set checked against the raw reply text.
pub const REPLY_COMPLETION_PHRASES: &[&str] = &[
    "task completed",
    "implementation complete",
    "done",
    "finished",
    "task is complete",
];

fn contains_any(text: &str, phrases: &[&str]) -> bool {
    let lower = text.to_lowercase();
    phrases.iter().any(|phrase| lower.contains(phrase))
}

/// True if any action output carries a completion phrase.
pub fn outputs_signal_completion<'a, I>(outputs: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    outputs
        .into_iter()
        .any(|output| contains_any(output, ACTION_COMPLETION_PHRASES))
}

/// True if the reply text itself claims completion.
pub fn reply_signals_completion(reply: &str) -> bool {
    contains_any(reply, REPLY_COMPLETION_PHRASES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_output_phrases_are_case_insensitive() {
        let outputs = ["$ ls\nsrc\nExit code: 0\n", "$ echo TASK COMPLETED\nTASK COMPLETED\n"];
        assert!(outputs_signal_completion(outputs));
        assert!(!outputs_signal_completion(["$ ls\nExit code: 0\n"]));
    }

    #[test]
    fn reply_phrases_are_broader() {
        assert!(reply_signals_completion("All done here."));
        assert!(reply_signals_completion("The task is complete."));
        assert!(!reply_signals_completion("Continuing with the next file."));
    }
}
