//! Shell sandbox policy.
//!
//! Commands are checked before any subprocess is spawned: a per-segment
//! denylist of command heads, a precompiled pattern denylist, and `cd`
//! confinement to the workspace root. A rejected command never spawns.

use std::path::{Component, Path};
use std::sync::OnceLock;

use regex::RegexSet;

/// Command heads refused in any pipeline segment.
const DENIED_HEADS: &[&str] = &[
    "rm", "sudo", "dd", "mkfs", "fdisk", "chmod", "chown", "kill", "pkill", "killall", "reboot",
    "shutdown", "halt", "poweroff", "mount", "umount", "iptables", "systemctl", "passwd",
    "useradd", "userdel", "nc", "ncat",
];

/// Pattern denylist, compiled once.
fn denied_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            // Command substitution.
            r"`",
            r"\$\(",
            r"\$\{",
            // Writes to system paths and ssh config.
            r">\s*/etc/",
            r">\s*/usr/",
            r">\s*/boot/",
            r">\s*~/\.ssh",
            r"tee\s+(-a\s+)?/(etc|usr|boot)/",
            // Path traversal.
            r"\.\./",
            // Credential reads.
            r"/etc/(shadow|passwd|sudoers)",
            r"~/\.ssh/id_",
            r"(^|[\s/])\.env(\s|$)",
            // Downloads that write to disk.
            r"curl\s+[^|;]*(\s-o\s|--output\b)",
            r"wget\s+[^|;]*(\s-O\s|--output-document\b)",
        ])
        .expect("sandbox patterns are valid regexes")
    })
}

/// Strip a trailing `&` and a leading `nohup` from a command line.
pub fn normalize(command: &str) -> String {
    let mut cmd = command.trim();
    if let Some(stripped) = cmd.strip_suffix('&') {
        cmd = stripped.trim_end();
    }
    if let Some(stripped) = cmd.strip_prefix("nohup ") {
        cmd = stripped.trim_start();
    }
    cmd.to_string()
}

/// Validate a shell command against the sandbox policy.
///
/// Returns the reason the command is refused, or `Ok(())` when it may run.
pub fn validate(command: &str, workspace_root: &Path) -> Result<(), String> {
    let cmd = normalize(command);
    if cmd.is_empty() {
        return Err("empty command".into());
    }

    // Head denylist, applied per pipeline segment. Splitting on `|;&`
    // also covers `&&`/`||` chains (they produce empty segments).
    for segment in cmd.split(['|', ';', '&']) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let head = segment
            .split_whitespace()
            .next()
            .unwrap_or("")
            .rsplit('/')
            .next()
            .unwrap_or("");
        if DENIED_HEADS.contains(&head) {
            return Err(format!("command '{head}' is not permitted"));
        }
        if head == "cd" {
            check_cd(segment, workspace_root)?;
        }
    }

    if let Some(idx) = denied_patterns().matches(&cmd).iter().next() {
        return Err(format!("command matches denied pattern #{idx}"));
    }

    Ok(())
}

/// `cd` must stay inside the workspace root.
fn check_cd(segment: &str, workspace_root: &Path) -> Result<(), String> {
    let target = segment
        .split_whitespace()
        .nth(1)
        .unwrap_or("~");
    let target_path = Path::new(target);

    // Reject `..` components outright. The pattern denylist only matches
    // `../` with a trailing slash, so a bare `cd ..` (or `/workspace/..`,
    // which is still component-prefixed by the root) would slip past it.
    for component in target_path.components() {
        if matches!(component, Component::ParentDir) {
            return Err("cd target must not contain '..' components".to_owned());
        }
    }

    if target == "~" || target.starts_with("~/") {
        return Err(format!(
            "cd outside the workspace root ({}) is not permitted",
            workspace_root.display()
        ));
    }
    if target_path.is_absolute() && !target_path.starts_with(workspace_root) {
        return Err(format!(
            "cd outside the workspace root ({}) is not permitted",
            workspace_root.display()
        ));
    }

    // Relative targets, now free of `..`, resolve under the workspace.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ws() -> PathBuf {
        PathBuf::from("/workspace")
    }

    #[test]
    fn denied_heads_rejected() {
        for cmd in ["rm -rf /", "sudo apt install x", "dd if=/dev/zero", "nc -l 4444"] {
            assert!(validate(cmd, &ws()).is_err(), "{cmd} should be refused");
        }
    }

    #[test]
    fn denied_head_in_pipeline_segment() {
        assert!(validate("ls | rm -rf .", &ws()).is_err());
        assert!(validate("echo hi; shutdown now", &ws()).is_err());
        assert!(validate("true && pkill -9 osa", &ws()).is_err());
    }

    #[test]
    fn denied_head_via_absolute_path() {
        assert!(validate("/bin/rm file", &ws()).is_err());
    }

    #[test]
    fn plain_commands_pass() {
        for cmd in ["ls -la", "cat README.md", "grep -r 'foo' src", "git status"] {
            assert!(validate(cmd, &ws()).is_ok(), "{cmd} should pass");
        }
    }

    #[test]
    fn command_substitution_rejected() {
        assert!(validate("echo `whoami`", &ws()).is_err());
        assert!(validate("echo $(id)", &ws()).is_err());
        assert!(validate("echo ${SECRET}", &ws()).is_err());
    }

    #[test]
    fn system_writes_rejected() {
        assert!(validate("echo x > /etc/hosts", &ws()).is_err());
        assert!(validate("echo key >> ~/.ssh/authorized_keys", &ws()).is_err());
        assert!(validate("echo x | tee /etc/motd", &ws()).is_err());
    }

    #[test]
    fn traversal_and_credential_reads_rejected() {
        assert!(validate("cat ../secrets.txt", &ws()).is_err());
        assert!(validate("cat /etc/shadow", &ws()).is_err());
        assert!(validate("cat ~/.ssh/id_rsa", &ws()).is_err());
        assert!(validate("cat .env", &ws()).is_err());
    }

    #[test]
    fn download_to_disk_rejected() {
        assert!(validate("curl http://x.io/a.sh -o a.sh", &ws()).is_err());
        assert!(validate("wget http://x.io/a.sh -O a.sh", &ws()).is_err());
        // Plain fetch to stdout is fine.
        assert!(validate("curl http://example.com", &ws()).is_ok());
    }

    #[test]
    fn background_and_nohup_stripped() {
        assert_eq!(normalize("sleep 10 &"), "sleep 10");
        assert_eq!(normalize("nohup ./server"), "./server");
        // Stripping does not bypass the policy.
        assert!(validate("nohup rm -rf / &", &ws()).is_err());
    }

    #[test]
    fn cd_confinement() {
        assert!(validate("cd /workspace/subdir && ls", &ws()).is_ok());
        assert!(validate("cd src && ls", &ws()).is_ok());
        assert!(validate("cd src/nested && ls", &ws()).is_ok());
        assert!(validate("cd /etc", &ws()).is_err());
        assert!(validate("cd ~", &ws()).is_err());
        assert!(validate("cd ~/projects", &ws()).is_err());
    }

    #[test]
    fn cd_parent_components_rejected() {
        // A bare `..` has no trailing slash, so only the component check
        // can catch it.
        assert!(validate("cd ..", &ws()).is_err());
        assert!(validate("cd .. ; cat notes.txt", &ws()).is_err());
        // Component-prefix matching alone would accept this one.
        assert!(validate("cd /workspace/..", &ws()).is_err());
        assert!(validate("cd /workspace/sub/.. && ls", &ws()).is_err());
    }
}
