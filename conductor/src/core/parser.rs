//! Extraction of typed actions from a free-text model reply.
//!
//! A reply is scanned by four independent passes:
//!
//! - shell blocks (```` ```bash ````) become run-commands,
//! - `<file path="...">```lang ... ```</file>` spans become file writes,
//! - `READ_FILE(path="...")` calls become read requests,
//! - `CREATE_WORKER(task_id="...", description="...", branch="...")` calls
//!   become spawn requests.
//!
//! Passes may touch overlapping spans. The parser is pure; structural problems
//! (e.g. a grouped command without a redirection) are reported as warnings
//! for the caller to log.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Prefix of the spawn directive. Lines starting with it are never run as commands.
pub const SPAWN_DIRECTIVE: &str = "CREATE_WORKER";

/// Lowercase fragments that mark a line as echoed command output rather than a command.
const OUTPUT_MARKERS: &[&str] = &[
    "switched to",
    "already up to date",
    "output:",
    "error:",
    "volume in drive",
    "directory of",
    "exit code:",
];

static SHELL_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:bash|sh|shell)\r?\n(.*?)\r?\n```").expect("shell block regex")
});
static GROUP_REDIRECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\)\s*>+\s*\S+").expect("group redirect regex"));
static FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<file\s+path="([^"]+)"\s*>\s*```(?:(\w+)\n)?(.*?)```\s*</file>"#)
        .expect("file tag regex")
});
static READ_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"READ_FILE\s*\(\s*path="([^"]+)"\s*\)"#).expect("read file regex")
});
static SPAWN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"CREATE_WORKER\s*\(\s*task_id="([^"]+)"\s*,\s*description="([^"]+)"\s*,\s*branch="([^"]+)"\s*\)"#,
    )
    .expect("spawn directive regex")
});

/// A file the model asked to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
    /// Path relative to the project working directory.
    pub path: String,
    /// Optional language hint from the fence (```` ```python ````).
    pub language: Option<String>,
    /// Fence body, trimmed.
    pub content: String,
}

/// A request to create a worker for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub task_id: String,
    pub description: String,
    pub branch: String,
}

impl SpawnRequest {
    pub fn new(
        task_id: impl Into<String>,
        description: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            description: description.into(),
            branch: branch.into(),
        }
    }
}

/// Run-commands extracted from shell blocks, in reply order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandExtraction {
    pub commands: Vec<String>,
    pub warnings: Vec<String>,
}

/// Every action found in one reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedReply {
    pub reads: Vec<String>,
    pub files: Vec<FileWrite>,
    pub commands: Vec<String>,
    pub spawns: Vec<SpawnRequest>,
    pub warnings: Vec<String>,
}

impl ParsedReply {
    /// True when the reply carries no action of any kind. Warnings do not count.
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
            && self.files.is_empty()
            && self.commands.is_empty()
            && self.spawns.is_empty()
    }
}

/// Run all four extraction passes over `text`.
pub fn parse_reply(text: &str) -> ParsedReply {
    let CommandExtraction { commands, warnings } = extract_commands(text);
    ParsedReply {
        reads: extract_reads(text),
        files: extract_files(text),
        commands,
        spawns: extract_spawns(text),
        warnings,
    }
}

/// Extract run-commands from every shell block in `text`.
pub fn extract_commands(text: &str) -> CommandExtraction {
    let mut out = CommandExtraction::default();
    for caps in SHELL_BLOCK_RE.captures_iter(text) {
        let block = caps.get(1).map_or("", |m| m.as_str()).trim();
        if block.starts_with('(') && block.contains(')') {
            extract_grouped(block, &mut out);
        } else {
            out.commands.extend(split_lines(block));
        }
    }
    out
}

/// A block opening with `(` is kept whole up to its `) > target` redirection.
fn extract_grouped(block: &str, out: &mut CommandExtraction) {
    let Some(redirect) = GROUP_REDIRECT_RE.find(block) else {
        out.warnings.push(format!(
            "grouped command without redirect: {}...",
            preview(block, 50)
        ));
        out.commands.extend(
            block
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .filter(|line| *line != "(" && *line != ")")
                .map(str::to_string),
        );
        return;
    };

    out.commands.push(block[..redirect.end()].to_string());
    out.commands.extend(
        block[redirect.end()..]
            .lines()
            .map(str::trim)
            .filter(|line| is_command_line(line))
            .filter(|line| !line.starts_with(SPAWN_DIRECTIVE))
            .map(str::to_string),
    );
}

/// Line-by-line extraction with `\` continuation joining.
fn split_lines(block: &str) -> Vec<String> {
    let mut commands = Vec::new();
    let mut pending: Vec<&str> = Vec::new();

    for line in block.lines().map(str::trim) {
        if !is_command_line(line) {
            continue;
        }
        if let Some(head) = line.strip_suffix('\\') {
            pending.push(head.trim_end());
            continue;
        }
        pending.push(line);
        push_joined(&mut commands, &mut pending);
    }
    push_joined(&mut commands, &mut pending);
    commands
}

fn push_joined(commands: &mut Vec<String>, pending: &mut Vec<&str>) {
    if pending.is_empty() {
        return;
    }
    let joined = pending.join(" ");
    pending.clear();
    if !joined.starts_with(SPAWN_DIRECTIVE) {
        commands.push(joined);
    }
}

fn is_command_line(line: &str) -> bool {
    !line.is_empty() && !line.starts_with('#') && !looks_like_output(line)
}

/// Heuristic for lines the model echoed from a previous command's output.
pub fn looks_like_output(line: &str) -> bool {
    let lower = line.to_lowercase();
    OUTPUT_MARKERS.iter().any(|marker| lower.contains(marker))
}

pub fn extract_files(text: &str) -> Vec<FileWrite> {
    FILE_RE
        .captures_iter(text)
        .map(|caps| FileWrite {
            path: caps[1].to_string(),
            language: caps.get(2).map(|m| m.as_str().to_string()),
            content: caps.get(3).map_or("", |m| m.as_str()).trim().to_string(),
        })
        .collect()
}

pub fn extract_reads(text: &str) -> Vec<String> {
    READ_FILE_RE
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

pub fn extract_spawns(text: &str) -> Vec<SpawnRequest> {
    SPAWN_RE
        .captures_iter(text)
        .map(|caps| SpawnRequest::new(&caps[1], &caps[2], &caps[3]))
        .collect()
}

/// First `max` characters of `text`, for log lines.
pub fn preview(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouped_command_stays_atomic_and_trailing_lines_split() {
        let reply = "Run this:\n```bash\n(echo one; echo two) > out.txt\ncat out.txt\nSwitched to branch 'main'\n# note\nls -la\n```\n";
        let got = extract_commands(reply);
        assert_eq!(
            got.commands,
            vec!["(echo one; echo two) > out.txt", "cat out.txt", "ls -la"]
        );
        assert!(got.warnings.is_empty());
    }

    #[test]
    fn multiline_group_keeps_span_through_append_redirect() {
        let reply = "```bash\n(\n  echo a\n  echo b\n) >> log.txt\necho done\n```";
        let got = extract_commands(reply);
        assert_eq!(
            got.commands,
            vec!["(\n  echo a\n  echo b\n) >> log.txt", "echo done"]
        );
    }

    #[test]
    fn group_without_redirect_falls_back_with_warning() {
        let reply = "```bash\n(\ncd src\nls\n)\n```";
        let got = extract_commands(reply);
        assert_eq!(got.commands, vec!["cd src", "ls"]);
        assert_eq!(got.warnings.len(), 1);
        assert!(got.warnings[0].contains("without redirect"));
    }

    #[test]
    fn line_mode_drops_comments_blanks_and_output_lines() {
        let reply = "```bash\n# setup\n\ngit checkout -b feature/x\nAlready up to date.\nExit code: 0\nnpm test\n```";
        let got = extract_commands(reply);
        assert_eq!(got.commands, vec!["git checkout -b feature/x", "npm test"]);
    }

    #[test]
    fn continuation_lines_join_into_one_command() {
        let reply = "```bash\ncargo build \\\n  --release \\\n  --locked\necho ok\n```";
        let got = extract_commands(reply);
        assert_eq!(
            got.commands,
            vec!["cargo build --release --locked", "echo ok"]
        );
    }

    #[test]
    fn spawn_directive_is_not_a_command() {
        let reply = "```bash\nCREATE_WORKER(task_id=\"phase1_setup\", description=\"Scaffold\", branch=\"feature/setup\")\necho hi\n```";
        let parsed = parse_reply(reply);
        assert_eq!(parsed.commands, vec!["echo hi"]);
        assert_eq!(
            parsed.spawns,
            vec![SpawnRequest::new(
                "phase1_setup",
                "Scaffold",
                "feature/setup"
            )]
        );
    }

    #[test]
    fn non_shell_fences_are_ignored() {
        let reply = "```python\nprint('x')\n```\n```\nplain\n```";
        assert!(extract_commands(reply).commands.is_empty());
    }

    #[test]
    fn sh_and_shell_tags_are_shell_blocks() {
        let reply = "```sh\necho a\n```\n```shell\necho b\n```";
        assert_eq!(extract_commands(reply).commands, vec!["echo a", "echo b"]);
    }

    #[test]
    fn file_tag_without_language() {
        let files = extract_files("<file path=\"README.md\">```Hello```</file>");
        assert_eq!(
            files,
            vec![FileWrite {
                path: "README.md".to_string(),
                language: None,
                content: "Hello".to_string(),
            }]
        );
    }

    #[test]
    fn file_tag_with_language_hint_and_trimmed_body() {
        let reply = "Here:\n<file path=\"src/app.py\">\n```python\n\nprint('hi')\n\n```\n</file>\nand\n<file path=\"a.txt\">```\nA\n```</file>";
        let files = extract_files(reply);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "src/app.py");
        assert_eq!(files[0].language.as_deref(), Some("python"));
        assert_eq!(files[0].content, "print('hi')");
        assert_eq!(files[1].language, None);
        assert_eq!(files[1].content, "A");
    }

    #[test]
    fn read_calls_keep_order() {
        let reply = "READ_FILE(path=\"PRD.md\") then READ_FILE( path=\"src/main.rs\" )";
        assert_eq!(extract_reads(reply), vec!["PRD.md", "src/main.rs"]);
    }

    #[test]
    fn spawn_directives_keep_order() {
        let reply = "CREATE_WORKER(task_id=\"phase1_a\", description=\"A\", branch=\"feature/a\")\nCREATE_WORKER(task_id=\"phase2_b\", description=\"B things\", branch=\"feature/b\")";
        let spawns = extract_spawns(reply);
        assert_eq!(spawns.len(), 2);
        assert_eq!(spawns[0].task_id, "phase1_a");
        assert_eq!(spawns[1].description, "B things");
    }

    #[test]
    fn prose_only_reply_is_empty() {
        let parsed = parse_reply("I will think about this project some more.");
        assert!(parsed.is_empty());
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn preview_is_char_boundary_safe() {
        assert_eq!(preview("héllo wörld", 4), "héll");
        assert_eq!(preview("abc", 10), "abc");
    }
}
