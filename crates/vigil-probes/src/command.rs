//! Command probe - allowlist model
//!
//! Perception only ever reads. A blocklist of "dangerous" commands misses
//! `find / -delete` and friends, so the policy is an allowlist of read-only
//! binaries and everything else is denied by default.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use vigil_core::{Probe, ProbeContext, ProbeOutput};

/// Which commands a `CommandProbe` may run
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed: HashSet<String>,
    /// Stdout beyond this many bytes is cut off
    pub max_output_bytes: usize,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        let mut policy = Self::empty();

        // Read-only system inspection
        // No awk or sed: both can write files and run commands
        for cmd in &[
            "cat", "head", "tail", "wc", "grep", "sort", "uniq", "cut", "tr",
            "echo", "date", "uptime", "uname", "hostname", "whoami", "who", "id",
            "df", "du", "free", "nproc", "lscpu", "ps", "vmstat", "iostat",
            "sensors", "nvidia-smi", "jq",
        ] {
            policy.allowed.insert(cmd.to_string());
        }

        policy
    }
}

impl CommandPolicy {
    /// A policy that denies everything
    pub fn empty() -> Self {
        Self {
            allowed: HashSet::new(),
            max_output_bytes: 16 * 1024,
        }
    }

    pub fn allow(&mut self, cmd: &str) {
        self.allowed.insert(cmd.to_string());
    }

    pub fn deny(&mut self, cmd: &str) {
        self.allowed.remove(cmd);
    }

    /// Check a command line against the allowlist
    pub fn check(&self, command: &str) -> Result<(), CommandDenied> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err(CommandDenied::Empty);
        }

        // Checked before splitting so a substitution can't hide in a pipe segment
        if trimmed.contains("$(") || trimmed.contains('`') {
            return Err(CommandDenied::SubshellBlocked);
        }
        if trimmed.contains('>') {
            return Err(CommandDenied::RedirectBlocked);
        }
        // `sh -c` treats a line break as a command separator
        if trimmed.contains(['\n', '\r']) {
            return Err(CommandDenied::MultilineBlocked);
        }

        // Every segment of a pipeline or chain must be allowed
        for segment in trimmed.split(|c: char| c == '|' || c == '&' || c == ';') {
            let Some(binary) = segment.split_whitespace().next() else {
                continue;
            };
            if !self.is_allowed(binary) {
                return Err(CommandDenied::NotAllowed(binary.to_string()));
            }
        }
        Ok(())
    }

    fn is_allowed(&self, cmd: &str) -> bool {
        // /usr/bin/df -> df
        let basename = cmd.rsplit('/').next().unwrap_or(cmd);
        self.allowed.contains(basename)
    }
}

/// Reasons a command is refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandDenied {
    #[error("Empty command")]
    Empty,
    #[error("Command not in allowlist: {0}")]
    NotAllowed(String),
    #[error("Subshell execution ($() or backticks) not allowed")]
    SubshellBlocked,
    #[error("Output redirection not allowed")]
    RedirectBlocked,
    #[error("Multi-line commands not allowed")]
    MultilineBlocked,
}

/// Run a command under `policy` and return its stdout
pub async fn run_command(policy: &CommandPolicy, command: &str) -> anyhow::Result<String> {
    policy.check(command)?;

    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("spawn failed: {}", e))?;

    if !output.status.success() {
        anyhow::bail!(
            "exit {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if stdout.len() > policy.max_output_bytes {
        let mut cut = policy.max_output_bytes;
        while !stdout.is_char_boundary(cut) {
            cut -= 1;
        }
        tracing::debug!(command, bytes = stdout.len(), "command output truncated");
        stdout.truncate(cut);
    }
    Ok(stdout)
}

/// Samples the trimmed stdout of one shell command
pub struct CommandProbe {
    kind: String,
    command: String,
    policy: Arc<CommandPolicy>,
}

impl CommandProbe {
    /// Fails up front if the policy would refuse `command`
    pub fn new(kind: impl Into<String>, command: impl Into<String>, policy: Arc<CommandPolicy>) -> Result<Self, CommandDenied> {
        let command = command.into();
        policy.check(&command)?;
        Ok(Self {
            kind: kind.into(),
            command,
            policy,
        })
    }
}

#[async_trait]
impl Probe for CommandProbe {
    async fn sample(&self, _ctx: &ProbeContext) -> anyhow::Result<ProbeOutput> {
        let stdout = run_command(&self.policy, &self.command).await?;
        Ok(ProbeOutput::new(
            self.kind.clone(),
            json!({ "command": self.command, "output": stdout.trim() }),
        ))
    }

    fn describe(&self) -> &str {
        &self.command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::ProbeKey;

    #[test]
    fn test_allowed_commands() {
        let policy = CommandPolicy::default();
        assert!(policy.check("uptime").is_ok());
        assert!(policy.check("df -Pk /").is_ok());
        assert!(policy.check("cat /proc/loadavg").is_ok());
    }

    #[test]
    fn test_blocked_commands() {
        let policy = CommandPolicy::default();
        assert_eq!(policy.check("rm -rf /"), Err(CommandDenied::NotAllowed("rm".into())));
        assert!(policy.check("sudo uptime").is_err());
        assert!(policy.check("mkdir /tmp/x").is_err());
        assert_eq!(policy.check("   "), Err(CommandDenied::Empty));
    }

    #[test]
    fn test_pipelines_and_chains() {
        let policy = CommandPolicy::default();
        assert!(policy.check("ps aux | grep sshd | wc -l").is_ok());
        assert!(policy.check("cat /etc/hosts | sh").is_err());
        assert!(policy.check("uptime && curl evil.example").is_err());
        assert!(policy.check("date; reboot").is_err());
    }

    #[test]
    fn test_subshell_and_redirects_blocked() {
        let policy = CommandPolicy::default();
        assert_eq!(policy.check("echo $(reboot)"), Err(CommandDenied::SubshellBlocked));
        assert_eq!(policy.check("uptime | echo `reboot`"), Err(CommandDenied::SubshellBlocked));
        assert_eq!(policy.check("echo hi > /etc/motd"), Err(CommandDenied::RedirectBlocked));
    }

    #[test]
    fn test_line_breaks_blocked() {
        let policy = CommandPolicy::default();
        assert_eq!(policy.check("echo a\ntouch /tmp/x"), Err(CommandDenied::MultilineBlocked));
        assert_eq!(policy.check("uptime\r\nreboot"), Err(CommandDenied::MultilineBlocked));
        // Surrounding whitespace is still fine
        assert!(policy.check("uptime\n").is_ok());
    }

    #[tokio::test]
    async fn test_second_line_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let command = format!("echo a\ntouch {}", marker.display());

        let err = run_command(&CommandPolicy::default(), &command).await.unwrap_err();
        assert!(err.downcast_ref::<CommandDenied>().is_some());
        assert!(!marker.exists());
    }

    #[test]
    fn test_scripting_tools_not_allowed() {
        let policy = CommandPolicy::default();
        assert_eq!(
            policy.check("awk 'BEGIN{system(\"reboot\")}'"),
            Err(CommandDenied::NotAllowed("awk".into()))
        );
        assert_eq!(
            policy.check("sed -i s/a/b/ /etc/hosts"),
            Err(CommandDenied::NotAllowed("sed".into()))
        );
        assert!(policy.check("cat /proc/loadavg | sed -n 1p").is_err());
    }

    #[test]
    fn test_path_stripping() {
        let policy = CommandPolicy::default();
        assert!(policy.check("/usr/bin/uptime").is_ok());
    }

    #[test]
    fn test_empty_policy_and_allow() {
        let mut policy = CommandPolicy::empty();
        assert!(policy.check("uptime").is_err());
        policy.allow("uptime");
        assert!(policy.check("uptime").is_ok());
        policy.deny("uptime");
        assert!(policy.check("uptime").is_err());
    }

    #[test]
    fn test_probe_refuses_denied_command() {
        let policy = Arc::new(CommandPolicy::default());
        assert!(CommandProbe::new("wipe", "rm -rf /", policy).is_err());
    }

    #[tokio::test]
    async fn test_probe_samples_stdout() {
        let policy = Arc::new(CommandPolicy::default());
        let probe = CommandProbe::new("greeting", "echo '  hello  '", policy).unwrap();

        let output = probe.sample(&ProbeContext::new(ProbeKey::from("greeting"))).await.unwrap();
        assert_eq!(output.kind, "greeting");
        assert_eq!(output.data["output"], "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let policy = CommandPolicy::default();
        let err = run_command(&policy, "cat /definitely/not/here").await.unwrap_err();
        assert!(err.to_string().starts_with("exit "));
    }

    #[tokio::test]
    async fn test_output_truncation() {
        let mut policy = CommandPolicy::default();
        policy.max_output_bytes = 4;
        let out = run_command(&policy, "echo abcdefgh").await.unwrap();
        assert_eq!(out, "abcd");
    }
}
