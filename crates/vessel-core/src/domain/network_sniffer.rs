//! Static pattern detector for network-touching shell commands (§4.9).
//!
//! Intentionally permissive: a command qualifies if any of a fixed tool
//! set appears at a shell-command boundary (start of string, whitespace,
//! `;`, `|`, `&&`, backticks, or `$(`), even where the substring turns
//! out to be a subcommand rather than the literal tool invocation.
//! Over-matching at those boundaries is acceptable — the gate defers to
//! a human — but a tool name immediately followed by a non-boundary
//! character (e.g. `-` in a filename like `curl-notes.txt`) does not
//! match. See REDESIGN FLAG #1: whether to tokenize properly instead of
//! substring-matching is a policy choice left to the caller, not
//! resolved here.

use std::sync::OnceLock;

use regex::Regex;

const TOOLS: &[&str] = &[
    "curl", "wget", "nc", "netcat", "ssh", "scp", "rsync", "ftp", "sftp", "telnet", "nmap", "ping",
];

const URL_SCHEMES: &[&str] = &["http://", "https://", "ftp://", "sftp://"];

fn tool_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // A tool qualifies at line start, after whitespace, after `|`,
        // after `&&`, after `;`, inside `$(`, or inside backticks.
        let tools = TOOLS.join("|");
        let pattern = format!(r"(?:^|[\s;|`]|&&|\$\()({tools})(?:[\s;|&`)]|$)");
        Regex::new(&pattern).expect("network sniffer pattern is a valid regex literal")
    })
}

/// Detect whether `command` touches the network via a known tool.
///
/// Returns `(tool, urls)` where `tool` is the first matching tool name (or
/// empty if none matched) and `urls` are the case-preserved whitespace
/// tokens from the original command that begin with a network URL scheme.
#[must_use]
pub fn detect_network_access(command: &str) -> (String, Vec<String>) {
    let lowered = command.to_lowercase();
    let tool = tool_pattern()
        .captures(&lowered)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();

    if tool.is_empty() {
        return (String::new(), Vec::new());
    }

    let urls = command
        .split_whitespace()
        .filter(|tok| URL_SCHEMES.iter().any(|scheme| tok.starts_with(scheme)))
        .map(std::string::ToString::to_string)
        .collect();

    (tool, urls)
}
