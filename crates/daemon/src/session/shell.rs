//! Shell invocation resolution.
//!
//! Decides what a new session runs. The result depends only on static
//! configuration and the requester's identity.

use crate::config::ShellConfig;

/// Program and arguments spawned for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInvocation {
    /// Program to execute, resolved through `PATH` when relative.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
}

impl ShellInvocation {
    /// Creates an invocation.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Resolves the invocation for a request.
    ///
    /// In login-shell mode this is `ssh [ssh_args...] [user@]host`; the
    /// request's own arguments are not forwarded to SSH. Otherwise it is the
    /// configured default shell with the request's arguments.
    pub fn resolve(config: &ShellConfig, username: Option<&str>, args: &[String]) -> Self {
        if config.login_shell {
            let destination = match username {
                Some(user) if !user.is_empty() => format!("{}@{}", user, config.ssh_host),
                _ => config.ssh_host.clone(),
            };

            let mut ssh_args = config.ssh_args.clone();
            ssh_args.push(destination);
            Self::new("ssh", ssh_args)
        } else {
            Self::new(config.default_shell.clone(), args.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ShellConfig {
        ShellConfig {
            default_shell: "/bin/bash".to_string(),
            ..ShellConfig::default()
        }
    }

    fn login_config() -> ShellConfig {
        ShellConfig {
            login_shell: true,
            ssh_host: "bastion".to_string(),
            ssh_args: vec!["-p".to_string(), "2222".to_string()],
            ..ShellConfig::default()
        }
    }

    #[test]
    fn test_local_shell_without_args() {
        let invocation = ShellInvocation::resolve(&local_config(), None, &[]);
        assert_eq!(invocation, ShellInvocation::new("/bin/bash", vec![]));
    }

    #[test]
    fn test_local_shell_forwards_request_args() {
        let args = vec!["-l".to_string()];
        let invocation = ShellInvocation::resolve(&local_config(), Some("alice"), &args);
        assert_eq!(invocation.program, "/bin/bash");
        assert_eq!(invocation.args, vec!["-l"]);
    }

    #[test]
    fn test_login_shell_with_user() {
        let invocation = ShellInvocation::resolve(&login_config(), Some("alice"), &[]);
        assert_eq!(invocation.program, "ssh");
        assert_eq!(invocation.args, vec!["-p", "2222", "alice@bastion"]);
    }

    #[test]
    fn test_login_shell_without_user() {
        let invocation = ShellInvocation::resolve(&login_config(), None, &[]);
        assert_eq!(invocation.args, vec!["-p", "2222", "bastion"]);

        let invocation = ShellInvocation::resolve(&login_config(), Some(""), &[]);
        assert_eq!(invocation.args, vec!["-p", "2222", "bastion"]);
    }

    #[test]
    fn test_login_shell_ignores_request_args() {
        let args = vec!["-c".to_string(), "rm -rf /".to_string()];
        let invocation = ShellInvocation::resolve(&login_config(), Some("bob"), &args);
        assert_eq!(invocation.args, vec!["-p", "2222", "bob@bastion"]);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let config = login_config();
        assert_eq!(
            ShellInvocation::resolve(&config, Some("carol"), &[]),
            ShellInvocation::resolve(&config, Some("carol"), &[])
        );
    }
}
