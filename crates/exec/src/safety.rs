//! Command deny-list.
//!
//! This is a best-effort text filter layered on top of OS-level isolation,
//! not a replacement for it.  A command is refused when any rule matches;
//! everything else is allowed.  Evaluation is stateless and deterministic.

use anyhow::{Context, Result};
use regex::Regex;
use thiserror::Error;
use tracing::warn;

/// Built-in rules: `(name, pattern)`.
const BUILTIN_RULES: &[(&str, &str)] = &[
    ("eval", r"\beval\b"),
    ("exec", r"\bexec\b"),
    (
        "inline-interpreter",
        r"\b(python[0-9.]*|perl|ruby|node|php)\b[^|;&]*\s-[ce]\b",
    ),
    (
        "nested-shell",
        r"\b(sh|bash|zsh|ksh|dash|fish)\s+(-\w+\s+)*-\w*c\b",
    ),
    ("command-substitution", r"\$\(|`"),
    (
        "process-spawn",
        r"\bos\.system\b|\bos\.exec\w*|\bsubprocess\b|\bpopen\b|\bspawn\w*|\bfork\b",
    ),
    ("rm-rf", r"\brm\s+(-[a-zA-Z]*\s+)*-[a-zA-Z]*(rf|fr)"),
];

/// Raised when a command matches a deny rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("command refused by safety rule '{rule}'")]
pub struct SafetyViolation {
    pub rule: String,
    pub command: String,
}

#[derive(Debug, Clone)]
struct DenyRule {
    name: String,
    pattern: Regex,
}

#[derive(Debug, Clone)]
pub struct SafetyGuard {
    rules: Vec<DenyRule>,
}

impl SafetyGuard {
    /// Build the guard from the built-in rules plus `extra_patterns`
    /// (`[safety].extra_deny_patterns`).  An invalid extra pattern is a
    /// start-up error.
    pub fn new(extra_patterns: &[String]) -> Result<Self> {
        let mut rules = Vec::with_capacity(BUILTIN_RULES.len() + extra_patterns.len());
        for (name, pattern) in BUILTIN_RULES {
            rules.push(DenyRule {
                name: (*name).to_string(),
                pattern: Regex::new(pattern)
                    .with_context(|| format!("invalid built-in deny rule '{name}'"))?,
            });
        }
        for pattern in extra_patterns {
            rules.push(DenyRule {
                name: format!("custom:{pattern}"),
                pattern: Regex::new(pattern)
                    .with_context(|| format!("invalid extra_deny_patterns entry '{pattern}'"))?,
            });
        }
        Ok(Self { rules })
    }

    pub fn is_command_allowed(&self, command: &str) -> bool {
        self.check(command).is_ok()
    }

    /// Like [`is_command_allowed`](Self::is_command_allowed) but names the
    /// first rule that matched.
    pub fn check(&self, command: &str) -> Result<(), SafetyViolation> {
        match self.rules.iter().find(|rule| rule.pattern.is_match(command)) {
            Some(rule) => {
                warn!(rule = %rule.name, %command, "command refused by safety guard");
                Err(SafetyViolation {
                    rule: rule.name.clone(),
                    command: command.to_string(),
                })
            }
            None => Ok(()),
        }
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> SafetyGuard {
        SafetyGuard::new(&[]).unwrap()
    }

    #[test]
    fn plain_commands_are_allowed() {
        let guard = guard();
        for cmd in [
            "echo hi",
            "ls -la",
            "cargo build --release",
            "python -m pytest",
            "python script.py --force",
            "bash build.sh",
            "grep -rn 'TODO' src",
            "rm -f old.log",
        ] {
            assert!(guard.is_command_allowed(cmd), "{cmd} should be allowed");
        }
    }

    #[test]
    fn denied_commands() {
        let guard = guard();
        let cases = [
            ("eval \"$X\"", "eval"),
            ("exec ls", "exec"),
            ("python3 -c 'import os'", "inline-interpreter"),
            ("perl -e 'print 1'", "inline-interpreter"),
            ("bash -c 'ls'", "nested-shell"),
            ("sh -lc 'whoami'", "nested-shell"),
            ("echo $(whoami)", "command-substitution"),
            ("echo `id`", "command-substitution"),
            ("import subprocess", "process-spawn"),
            ("rm -rf /", "rm-rf"),
            ("rm -v -fr build", "rm-rf"),
        ];
        for (cmd, rule) in cases {
            let violation = guard.check(cmd).unwrap_err();
            assert_eq!(violation.rule, rule, "{cmd}");
            assert_eq!(violation.command, cmd);
            assert!(!guard.is_command_allowed(cmd));
        }
    }

    #[test]
    fn extra_patterns_apply() {
        let guard = SafetyGuard::new(&[r"\bcurl\b".to_string()]).unwrap();
        let violation = guard.check("curl https://example.com").unwrap_err();
        assert_eq!(violation.rule, r"custom:\bcurl\b");
        assert!(guard.is_command_allowed("wget --help"));
    }

    #[test]
    fn invalid_extra_pattern_is_an_error() {
        let err = SafetyGuard::new(&["(".to_string()]).unwrap_err();
        assert!(err.to_string().contains("extra_deny_patterns"));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let guard = guard();
        for _ in 0..3 {
            assert!(!guard.is_command_allowed("rm -rf ~"));
            assert!(guard.is_command_allowed("echo ok"));
        }
    }

    #[test]
    fn rule_names_lists_builtins_and_extras() {
        let guard = SafetyGuard::new(&["sudo".to_string()]).unwrap();
        let names: Vec<_> = guard.rule_names().collect();
        assert_eq!(names.first(), Some(&"eval"));
        assert_eq!(names.last(), Some(&"custom:sudo"));
    }
}
