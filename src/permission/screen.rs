//! Post-hoc screening of result text for sensitive operations.
//!
//! The orchestrator runs every RESULT_REPORT through this table before
//! forwarding it. A hit means the worker already did (or claims to have
//! done) something a human should sign off on, so the result is held
//! behind a retroactive permission record instead of being announced.

use std::sync::LazyLock;

use regex::Regex;

use super::{Operation, OperationKind};

struct ScreenRule {
    label: &'static str,
    kind: OperationKind,
    pattern: Regex,
}

/// Capture group 1 is the operation detail that goes on the record.
static SCREEN_RULES: LazyLock<Vec<ScreenRule>> = LazyLock::new(|| {
    vec![
        ScreenRule {
            label: "destructive_shell",
            kind: OperationKind::Shell,
            pattern: Regex::new(
                r"(?i)\b((?:sudo\s+)?rm\s+-(?:rf|fr|r|f)\w*\s+\S+|mkfs(?:\.\w+)?\s+\S+|dd\s+if=\S+\s+of=\S+|shutdown(?:\s+-\w+){0,3}|git\s+push\s+(?:--force|-f)(?:\s+\S+){0,3}|git\s+reset\s+--hard(?:\s+\S+)?|drop\s+(?:table|database)\s+\S+|truncate\s+table\s+\S+)",
            )
            .unwrap(),
        },
        ScreenRule {
            label: "credential_access",
            kind: OperationKind::Path,
            pattern: Regex::new(
                r"(?i)(\S*(?:/\.ssh/|id_rsa|id_ed25519|\.aws/credentials|\.netrc)\S*|/etc/shadow|/etc/sudoers)",
            )
            .unwrap(),
        },
        ScreenRule {
            label: "service_mutation",
            kind: OperationKind::Shell,
            pattern: Regex::new(
                r"(?i)\b(systemctl\s+(?:stop|disable|mask|restart)\s+\S+|launchctl\s+unload\s+\S+|kill\s+-9\s+\S+|killall\s+\S+|pkill\s+\S+)",
            )
            .unwrap(),
        },
        ScreenRule {
            label: "network_mutation",
            kind: OperationKind::Shell,
            pattern: Regex::new(
                r"(?i)\b(iptables\s+-[A-Z]\s+[^\n]{1,80}|nft\s+(?:add|delete|flush)\s+[^\n]{1,80}|ufw\s+(?:allow|deny|delete|disable)\b[^\n]{0,40}|ip\s+route\s+(?:add|del|replace)\s+[^\n]{1,60})",
            )
            .unwrap(),
        },
    ]
});

/// One sensitive operation found in a result.
#[derive(Debug, Clone)]
pub struct ScreenHit {
    pub rule: &'static str,
    pub operation: Operation,
    /// The line the match came from, for the human reading the record.
    pub context: String,
}

/// Scan free text for operations that need a human's sign-off.
pub fn screen_text(text: &str) -> Vec<ScreenHit> {
    let mut hits = Vec::new();
    let mut seen: Vec<(&str, String)> = Vec::new();

    for rule in SCREEN_RULES.iter() {
        for caps in rule.pattern.captures_iter(text) {
            let Some(m) = caps.get(1) else { continue };
            // Results quote commands in prose; shed the backticks and
            // punctuation that ride along with the match.
            let detail = m
                .as_str()
                .trim()
                .trim_matches(|c: char| matches!(c, '`' | '"' | '\'' | ',' | '.' | ';' | ':' | ')' | ']'))
                .to_string();
            if seen.iter().any(|(label, d)| *label == rule.label && *d == detail) {
                continue;
            }
            seen.push((rule.label, detail.clone()));

            let operation = match rule.kind {
                OperationKind::Shell => Operation::Shell { command: detail },
                OperationKind::Path => Operation::Path { path: detail },
                OperationKind::Url => Operation::Url { url: detail },
            };
            hits.push(ScreenHit {
                rule: rule.label,
                operation,
                context: containing_line(text, m.start()),
            });
        }
    }
    hits
}

fn containing_line(text: &str, offset: usize) -> String {
    let start = text[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let end = text[offset..]
        .find('\n')
        .map(|i| offset + i)
        .unwrap_or(text.len());
    let line = text[start..end].trim();
    if line.chars().count() > 160 {
        format!("{}…", line.chars().take(160).collect::<String>())
    } else {
        line.to_string()
    }
}
