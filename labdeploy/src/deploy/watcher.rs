//! Classification of remote output lines into lifecycle events

use regex::{Captures, Regex};
use tracing::debug;

use crate::errors::LabError;
use crate::logs::RAW_TARGET;
use crate::models::event::LifecycleEvent;

/// `Starting "r1"...`, `Starting nodeA`
pub const NODE_STARTING_PATTERN: &str = r#"^\s*Starting\s+"?([^"\s]+?)"?\.*\s*$"#;

pub const LAB_STARTED_PATTERN: &str = r"The lab has been started";

/// Tools watched for a missing dependency in addition to the configured ones
pub const BASE_TOOLS: &[&str] = &["make"];

pub const ALREADY_RUNNING_PATTERN: &str = r"(?i)already running";

type Constructor = fn(&Captures<'_>) -> LifecycleEvent;

struct Rule {
    name: &'static str,
    pattern: Regex,
    build: Constructor,
}

/// Ordered (pattern, event) rules; the first matching rule wins
pub struct PatternWatcher {
    rules: Vec<Rule>,
}

impl PatternWatcher {
    /// A watcher with no rules
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Rules for Netkit `lstart` output. Only `make` and `tools` can be
    /// reported missing.
    pub fn lab_lifecycle(tools: &[String]) -> Result<Self, LabError> {
        let pattern = dependency_missing_pattern(tools);
        Self::empty()
            .with_rule("dependency_missing", &pattern, |caps| {
                LifecycleEvent::DependencyMissing(capture(caps, 1))
            })?
            .with_rule("already_running", ALREADY_RUNNING_PATTERN, |_| {
                LifecycleEvent::AlreadyRunning
            })?
            .with_rule("lab_started", LAB_STARTED_PATTERN, |_| {
                LifecycleEvent::LabStarted
            })?
            .with_rule("node_starting", NODE_STARTING_PATTERN, |caps| {
                LifecycleEvent::NodeStarting(capture(caps, 1))
            })
    }

    /// Append a rule after the existing ones
    pub fn with_rule(
        mut self,
        name: &'static str,
        pattern: &str,
        build: Constructor,
    ) -> Result<Self, LabError> {
        self.rules.push(Rule {
            name,
            pattern: Regex::new(pattern)?,
            build,
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Classify one line. Unmatched lines go to the raw log.
    pub fn classify(&self, host: &str, line: &str) -> Option<LifecycleEvent> {
        for rule in &self.rules {
            if let Some(caps) = rule.pattern.captures(line) {
                debug!(host = %host, rule = rule.name, "Matched output line");
                return Some((rule.build)(&caps));
            }
        }
        debug!(target: RAW_TARGET, host = %host, "{}", line);
        None
    }
}

/// `make: not found`, `bash: lstart: command not found`, `sh: 1: lstart: not found`.
/// The whole line must be the shell's report for one of the named tools.
pub fn dependency_missing_pattern(tools: &[String]) -> String {
    let mut names: Vec<String> = BASE_TOOLS.iter().map(|t| regex::escape(t)).collect();
    for tool in tools {
        let escaped = regex::escape(tool.trim());
        if !escaped.is_empty() && !names.contains(&escaped) {
            names.push(escaped);
        }
    }
    format!(
        r"^\s*(?:\S+:\s+)*({}):\s+(?:command\s+)?not found\s*$",
        names.join("|")
    )
}

fn capture(caps: &Captures<'_>, group: usize) -> String {
    caps.get(group)
        .map(|m| m.as_str().trim_end_matches('.').to_string())
        .unwrap_or_default()
}
