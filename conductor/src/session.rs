//! One agent's conversation with the model and the actions it applies.
//!
//! An [`AgentSession`] owns the conversation (opened by the role's fixed
//! system prompt), queries the model with bounded retries, and applies the
//! actions parsed from each reply in a fixed order:
//!
//! 1. read-file requests, each result appended to the conversation;
//! 2. file writes under the project directory, each confirmed in the conversation;
//! 3. run-commands in reply order, stopping the batch at the first failure, each
//!    command's captured output appended before the next runs.
//!
//! Failures close to the model or the shell become conversation content, never errors.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::agents::AgentContext;
use crate::core::parser::{FileWrite, ParsedReply, parse_reply, preview};
use crate::core::types::{AgentRole, LogEntry, LogLevel, Message, short_id};
use crate::io::completion::CompletionError;
use crate::io::prompt::system_prompt;
use crate::io::workspace::Workspace;

/// Attempt budget and exponential backoff for model queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
}

impl RetryPolicy {
    /// Delay before the 0-based `attempt`; the first attempt never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(self.backoff_base_secs.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ReadFile,
    CreateFile,
    RunCommand,
}

/// Result of applying one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub kind: ActionKind,
    pub succeeded: bool,
    pub output: String,
}

/// Which actions of a reply to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionScope {
    pub files: bool,
    /// Maximum run-commands to execute; `None` runs them all.
    pub command_limit: Option<usize>,
}

impl ActionScope {
    /// Reads, writes, and every command.
    pub const ALL: ActionScope = ActionScope {
        files: true,
        command_limit: None,
    };

    /// Reads and commands; file writes are ignored.
    pub const WITHOUT_FILES: ActionScope = ActionScope {
        files: false,
        command_limit: None,
    };

    /// Reads and at most `cap` commands, for observability only.
    pub fn diagnostics(cap: usize) -> Self {
        ActionScope {
            files: false,
            command_limit: Some(cap),
        }
    }
}

/// Everything a reply contained and what applying it produced.
#[derive(Debug, Clone, Default)]
pub struct AppliedReply {
    pub parsed: ParsedReply,
    pub outcomes: Vec<ActionOutcome>,
}

impl AppliedReply {
    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().map(|outcome| outcome.output.as_str())
    }
}

pub struct AgentSession {
    agent_id: String,
    role: AgentRole,
    conversation: Vec<Message>,
    ctx: AgentContext,
    workspace: Arc<Workspace>,
    retry: RetryPolicy,
}

impl AgentSession {
    pub fn new(
        agent_id: impl Into<String>,
        role: AgentRole,
        ctx: AgentContext,
        workspace: Arc<Workspace>,
    ) -> Self {
        let retry = RetryPolicy {
            max_attempts: ctx.config.query.max_attempts,
            backoff_base_secs: ctx.config.query.backoff_base_secs,
        };
        Self {
            agent_id: agent_id.into(),
            role,
            conversation: vec![Message::system(system_prompt(role))],
            ctx,
            workspace,
            retry,
        }
    }

    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Append an audit entry and mirror it to tracing.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let agent = short_id(&self.agent_id);
        let role = self.role.as_str();
        match level {
            LogLevel::Debug => debug!(agent, role, "{message}"),
            LogLevel::Info => info!(agent, role, "{message}"),
            LogLevel::Warning => warn!(agent, role, "{message}"),
            LogLevel::Error => error!(agent, role, "{message}"),
        }
        self.ctx
            .registry
            .append_log(&self.agent_id, LogEntry::new(level, message));
    }

    /// Send `prompt` and return the model's reply.
    ///
    /// Never fails: once the attempt budget is spent, the unanswered prompt is
    /// removed from the conversation and a synthetic failure string is returned.
    pub fn query(&mut self, prompt: &str) -> String {
        let before = self.conversation.len();
        self.conversation.push(Message::user(prompt));
        self.log(
            LogLevel::Info,
            format!("Querying model with: {}...", preview(prompt.trim(), 100)),
        );

        let max_attempts = self.retry.max_attempts;
        let mut last_error: Option<CompletionError> = None;
        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.retry.delay_before(attempt);
                self.log(
                    LogLevel::Warning,
                    format!(
                        "Retry attempt {}/{} after {}s delay",
                        attempt + 1,
                        max_attempts,
                        delay.as_secs()
                    ),
                );
                self.ctx.sleeper.sleep(delay);
            }

            match self.ctx.client.complete(&self.conversation) {
                Ok(reply) => {
                    self.log(
                        LogLevel::Info,
                        format!("Model response received: {} chars", reply.len()),
                    );
                    self.conversation.push(Message::assistant(reply.clone()));
                    return reply;
                }
                Err(err) => {
                    self.log(
                        LogLevel::Error,
                        format!(
                            "Model error (attempt {}/{}): {err}",
                            attempt + 1,
                            max_attempts
                        ),
                    );
                    if !err.is_transient() {
                        self.log(
                            LogLevel::Debug,
                            "Failure is not a rate limit or timeout; retrying within budget",
                        );
                    }
                    last_error = Some(err);
                }
            }
        }

        self.conversation.truncate(before);
        let last = last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string());
        let fallback =
            format!("Model query failed after {max_attempts} attempts. Last error: {last}");
        self.log(LogLevel::Error, fallback.clone());
        fallback
    }

    /// Parse `reply` and apply every action it contains.
    pub fn apply_reply(&mut self, reply: &str) -> AppliedReply {
        self.apply_actions(parse_reply(reply), ActionScope::ALL)
    }

    /// Apply parsed actions within `scope`, in read → write → run order.
    pub fn apply_actions(&mut self, parsed: ParsedReply, scope: ActionScope) -> AppliedReply {
        for warning in &parsed.warnings {
            self.log(LogLevel::Warning, format!("Warning: {warning}"));
        }
        if parsed.is_empty() {
            debug!(agent = %short_id(&self.agent_id), "reply carried no actions");
            return AppliedReply {
                parsed,
                outcomes: Vec::new(),
            };
        }

        let mut outcomes = Vec::new();
        for path in &parsed.reads {
            outcomes.push(self.read_file(path));
        }
        if scope.files {
            for file in &parsed.files {
                outcomes.push(self.create_file(file));
            }
        }
        let limit = scope.command_limit.unwrap_or(parsed.commands.len());
        let commands = &parsed.commands[..limit.min(parsed.commands.len())];
        if !commands.is_empty() {
            self.log(
                LogLevel::Info,
                format!("Extracted {} commands from response", commands.len()),
            );
        }
        outcomes.extend(self.run_commands(commands));

        AppliedReply { parsed, outcomes }
    }

    fn read_file(&mut self, path: &str) -> ActionOutcome {
        let (succeeded, output) = match self.workspace.read_file(path) {
            Ok(content) => {
                self.log(
                    LogLevel::Info,
                    format!("Read file: {path} ({} chars)", content.len()),
                );
                (true, format!("Contents of {path}:\n{content}"))
            }
            Err(e) => {
                let output = format!("Failed to read file {path}: {e:#}");
                self.log(LogLevel::Warning, output.clone());
                (false, output)
            }
        };
        self.conversation.push(Message::user(output.clone()));
        ActionOutcome {
            kind: ActionKind::ReadFile,
            succeeded,
            output,
        }
    }

    fn create_file(&mut self, file: &FileWrite) -> ActionOutcome {
        let path = &file.path;
        match self.workspace.write_file(path, &file.content) {
            Ok(_) => {
                self.log(
                    LogLevel::Info,
                    format!(
                        "Created file: {path} ({} chars, language: {})",
                        file.content.len(),
                        file.language.as_deref().unwrap_or("auto")
                    ),
                );
                self.conversation
                    .push(Message::user(format!("File created: {path}")));
                ActionOutcome {
                    kind: ActionKind::CreateFile,
                    succeeded: true,
                    output: format!("Created file: {path}\nSize: {} bytes", file.content.len()),
                }
            }
            Err(e) => {
                let output = format!("Failed to create file {path}: {e:#}");
                self.log(LogLevel::Error, output.clone());
                self.conversation.push(Message::user(output.clone()));
                ActionOutcome {
                    kind: ActionKind::CreateFile,
                    succeeded: false,
                    output,
                }
            }
        }
    }

    /// Run `commands` in order, stopping after the first failure.
    pub fn run_commands(&mut self, commands: &[String]) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::new();
        for command in commands {
            self.log(
                LogLevel::Info,
                format!("Executing: {}", preview(command, 100)),
            );
            let result = self.ctx.shell.run(command, self.workspace.root());
            self.conversation
                .push(Message::user(format!("Command executed:\n{}", result.output)));
            let succeeded = result.succeeded;
            outcomes.push(ActionOutcome {
                kind: ActionKind::RunCommand,
                succeeded,
                output: result.output,
            });
            if !succeeded {
                self.log(LogLevel::Error, format!("Command failed: {command}"));
                break;
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Role;
    use crate::test_support::{RecordingSleeper, ScriptedClient, test_context};
    use std::fs;

    fn session(
        client: ScriptedClient,
        temp: &tempfile::TempDir,
    ) -> (AgentSession, Arc<RecordingSleeper>, AgentContext) {
        let sleeper = Arc::new(RecordingSleeper::default());
        let ctx = test_context(temp.path(), Arc::new(client)).with_sleeper(sleeper.clone());
        let workspace = Arc::new(Workspace::new(temp.path().join("project")));
        let session = AgentSession::new("agent-0001", AgentRole::Worker, ctx.clone(), workspace);
        (session, sleeper, ctx)
    }

    #[test]
    fn conversation_opens_with_role_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (session, _, _) = session(ScriptedClient::new(Vec::new()), &temp);
        assert_eq!(session.conversation().len(), 1);
        assert_eq!(session.conversation()[0].role, Role::System);
        assert_eq!(
            session.conversation()[0].content,
            system_prompt(AgentRole::Worker)
        );
    }

    #[test]
    fn successful_query_appends_prompt_and_reply() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut session, sleeper, _) =
            session(ScriptedClient::replies(["Sure thing."]), &temp);
        let reply = session.query("Build it");
        assert_eq!(reply, "Sure thing.");
        let conversation = session.conversation();
        assert_eq!(conversation.len(), 3);
        assert_eq!(conversation[1], Message::user("Build it"));
        assert_eq!(conversation[2], Message::assistant("Sure thing."));
        assert!(sleeper.delays().is_empty());
    }

    #[test]
    fn rate_limited_query_backs_off_then_drops_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let client = ScriptedClient::new(vec![
            Err(CompletionError::RateLimited("slow down".to_string())),
            Err(CompletionError::RateLimited("slow down".to_string())),
            Err(CompletionError::RateLimited("slow down".to_string())),
        ]);
        let (mut session, sleeper, _) = session(client, &temp);
        let before = session.conversation().len();

        let reply = session.query("Build it");

        assert!(reply.starts_with("Model query failed after 3 attempts"));
        assert!(reply.contains("slow down"));
        assert_eq!(session.conversation().len(), before);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[test]
    fn backoff_delays_strictly_increase() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base_secs: 2,
        };
        let delays: Vec<u64> = (1..5).map(|i| policy.delay_before(i).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16]);
        assert_eq!(policy.delay_before(0), Duration::ZERO);
    }

    #[test]
    fn non_transient_failures_still_use_the_budget() {
        let temp = tempfile::tempdir().expect("tempdir");
        let client = ScriptedClient::new(vec![
            Err(CompletionError::Other("bad gateway".to_string())),
            Ok("recovered".to_string()),
        ]);
        let (mut session, sleeper, _) = session(client, &temp);
        assert_eq!(session.query("hi"), "recovered");
        assert_eq!(sleeper.delays(), vec![Duration::from_secs(2)]);
        assert_eq!(session.conversation().len(), 3);
    }

    #[test]
    fn file_tag_creates_file_and_confirms_without_running_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut session, _, _) = session(ScriptedClient::new(Vec::new()), &temp);
        let applied = session.apply_reply("<file path=\"README.md\">```Hello```</file>");

        let readme = temp.path().join("project/README.md");
        assert_eq!(fs::read_to_string(readme).expect("readme"), "Hello");
        assert_eq!(applied.outcomes.len(), 1);
        assert_eq!(applied.outcomes[0].kind, ActionKind::CreateFile);
        assert!(applied.parsed.commands.is_empty());
        assert_eq!(
            session.conversation().last().expect("message"),
            &Message::user("File created: README.md")
        );
    }

    #[cfg(unix)]
    #[test]
    fn reads_then_writes_then_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut session, _, _) = session(ScriptedClient::new(Vec::new()), &temp);
        session
            .workspace()
            .write_file("notes.txt", "old")
            .expect("seed");

        let reply = "```bash\ncat notes.txt\n```\n<file path=\"notes.txt\">```new```</file>\nREAD_FILE(path=\"notes.txt\")";
        let applied = session.apply_reply(reply);

        let kinds: Vec<ActionKind> = applied.outcomes.iter().map(|o| o.kind).collect();
        assert_eq!(
            kinds,
            vec![ActionKind::ReadFile, ActionKind::CreateFile, ActionKind::RunCommand]
        );
        let contents: Vec<&str> = session.conversation()[1..]
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(
            contents,
            vec![
                "Contents of notes.txt:\nold",
                "File created: notes.txt",
                "Command executed:\n$ cat notes.txt\nnew\nExit code: 0\n",
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn command_batch_stops_at_first_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut session, _, _) = session(ScriptedClient::new(Vec::new()), &temp);
        let applied = session.apply_reply("```bash\necho first\nfalse\necho never\n```");
        assert_eq!(applied.outcomes.len(), 2);
        assert!(applied.outcomes[0].succeeded);
        assert!(!applied.outcomes[1].succeeded);
        assert!(
            !session
                .conversation()
                .iter()
                .any(|m| m.content.contains("echo never"))
        );
    }

    #[test]
    fn missing_read_and_escaping_write_become_conversation_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut session, _, _) = session(ScriptedClient::new(Vec::new()), &temp);
        let reply = "READ_FILE(path=\"absent.md\")\n<file path=\"../escape.txt\">```x```</file>";
        let applied = session.apply_reply(reply);
        assert!(applied.outcomes.iter().all(|o| !o.succeeded));
        assert!(!temp.path().join("escape.txt").exists());
        let last_two: Vec<&str> = session.conversation()[1..]
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(last_two[0], "Failed to read file absent.md: file not found");
        assert!(last_two[1].starts_with("Failed to create file ../escape.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn diagnostics_scope_caps_commands_and_skips_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut session, _, _) = session(ScriptedClient::new(Vec::new()), &temp);
        let reply = "<file path=\"x.txt\">```x```</file>\n```bash\necho 1\necho 2\necho 3\necho 4\n```";
        let applied = session.apply_actions(parse_reply(reply), ActionScope::diagnostics(3));
        assert_eq!(applied.outcomes.len(), 3);
        assert!(!temp.path().join("project/x.txt").exists());
    }

    #[test]
    fn audit_log_records_query_activity() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mut session, _, ctx) = session(ScriptedClient::replies(["ok"]), &temp);
        ctx.registry.insert_agent(crate::core::types::AgentRecord::new(
            "agent-0001",
            AgentRole::Worker,
            "p",
        ));
        session.query("hello");
        let logs = ctx.registry.logs("agent-0001");
        assert!(logs.iter().any(|e| e.message.starts_with("Querying model with: hello")));
        assert!(logs.iter().any(|e| e.message.contains("2 chars")));
    }
}
