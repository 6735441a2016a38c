//! Destructive-command deny filter
//!
//! Screens `/run` commands against known-destructive shell idioms before
//! anything is spawned. This is string-level defense in depth, not a
//! sandbox: it does not parse shell semantics, so obfuscated or indirect
//! invocations (variables, scripts, `eval`) can evade it. Known limitation.

use once_cell::sync::Lazy;
use regex::Regex;

/// Outcome of screening a command string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied(String),
}

impl Verdict {
    pub fn is_denied(&self) -> bool {
        matches!(self, Verdict::Denied(_))
    }
}

struct DenyRule {
    pattern: &'static str,
    reason: &'static str,
}

const DENY_RULES: &[DenyRule] = &[
    DenyRule {
        pattern: r"(?i)\brm\s+(-[a-z]*r[a-z]*f|-[a-z]*f[a-z]*r)[a-z]*\s+(/|\$HOME|~)(\s|$)",
        reason: "recursive force-delete of a root-like path",
    },
    DenyRule {
        pattern: r"(?i)\bmkfs(\.[a-z0-9]+)?\b",
        reason: "filesystem format",
    },
    DenyRule {
        pattern: r"(?i)\bdd\b.*\bof=/dev/(sd|hd|nvme|disk|mmcblk)",
        reason: "write to a raw block device",
    },
    DenyRule {
        pattern: r":\(\)\s*\{\s*:\|:&\s*\}\s*;\s*:",
        reason: "fork bomb",
    },
    DenyRule {
        pattern: r"(?i)\bchmod\s+(-[a-z]*r[a-z]*\s+)?777\s+/(\s|$)",
        reason: "recursive world-writable chmod on /",
    },
    DenyRule {
        pattern: r"(?i)\bsudo\s+rm\b",
        reason: "privileged delete",
    },
    DenyRule {
        pattern: r"(?i)\b(curl|wget)\b[^|;]*\|\s*(ba|z|da|k)?sh\b",
        reason: "remote script piped into a shell",
    },
    DenyRule {
        pattern: r"(?i)\b(shutdown|reboot|poweroff|halt|init\s+[06])\b",
        reason: "system shutdown/reboot",
    },
];

static COMPILED_RULES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    DENY_RULES
        .iter()
        .map(|rule| {
            let re = Regex::new(rule.pattern)
                .unwrap_or_else(|e| panic!("invalid deny pattern '{}': {}", rule.pattern, e));
            (re, rule.reason)
        })
        .collect()
});

/// Classify a command string against the deny rules. First match wins.
pub fn classify(command: &str) -> Verdict {
    for (re, reason) in COMPILED_RULES.iter() {
        if re.is_match(command) {
            return Verdict::Denied(format!("Blocked: command looks like a {}.", reason));
        }
    }
    Verdict::Allowed
}
