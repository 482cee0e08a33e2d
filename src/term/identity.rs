//! Terminal identity resolution.
//!
//! Three independent keys: `terminal_name` (what the terminal is),
//! `terminal_id` (which terminal window uploads go to) and `session_id`
//! (which database file ids are allocated in). Resolved once per process
//! from the environment, each overridable through the configuration.

use crate::config::Config;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalIdentity {
    pub terminal_name: String,
    pub terminal_id: String,
    pub session_id: String,
}

/// Replace characters that are unsafe in identifiers and file names.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn tmux_display_message(format: &str) -> Option<String> {
    let output = Command::new("tmux")
        .args(["display-message", "-p", format])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn detect() -> TerminalIdentity {
    // Inside tmux the outer client identifies the terminal and the tmux
    // session identifies the id-allocation scope.
    if std::env::var("TMUX").map(|v| !v.is_empty()).unwrap_or(false) {
        if let Some(data) = tmux_display_message("#{client_termname}||#{client_pid}||#{pid}_#{session_id}")
        {
            let parts: Vec<&str> = data.split("||").collect();
            if parts.len() == 3 {
                return TerminalIdentity {
                    terminal_name: sanitize(parts[0]),
                    terminal_id: sanitize(&format!("tmux-client-{}-{}", parts[0], parts[1])),
                    session_id: sanitize(&format!("tmux-{}", parts[2])),
                };
            }
        }
    }

    let terminal_name = std::env::var("TERM").unwrap_or_else(|_| "unknown-terminal".to_string());
    let window_id =
        std::env::var("WINDOWID").unwrap_or_else(|_| "unknown-window".to_string());
    let terminal_id = sanitize(&format!("{}-{}", terminal_name, window_id));
    TerminalIdentity {
        terminal_name: sanitize(&terminal_name),
        session_id: terminal_id.clone(),
        terminal_id,
    }
}

impl TerminalIdentity {
    /// Resolve the identity, letting configured values win over detection.
    pub fn resolve(config: &Config) -> TerminalIdentity {
        if !config.terminal_name.is_empty()
            && !config.terminal_id.is_empty()
            && !config.session_id.is_empty()
        {
            return TerminalIdentity {
                terminal_name: sanitize(&config.terminal_name),
                terminal_id: sanitize(&config.terminal_id),
                session_id: sanitize(&config.session_id),
            };
        }
        let detected = detect();
        TerminalIdentity {
            terminal_name: if config.terminal_name.is_empty() {
                detected.terminal_name
            } else {
                sanitize(&config.terminal_name)
            },
            terminal_id: if config.terminal_id.is_empty() {
                detected.terminal_id
            } else {
                sanitize(&config.terminal_id)
            },
            session_id: if config.session_id.is_empty() {
                detected.session_id
            } else {
                sanitize(&config.session_id)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("xterm-256color"), "xterm-256color");
        assert_eq!(sanitize("a b/c:d"), "a_b_c_d");
    }

    #[test]
    fn test_config_overrides_win() {
        let mut config = Config::default();
        config.terminal_name = "st".to_string();
        config.terminal_id = "st 42".to_string();
        config.session_id = "sess/1".to_string();
        let identity = TerminalIdentity::resolve(&config);
        assert_eq!(identity.terminal_name, "st");
        assert_eq!(identity.terminal_id, "st_42");
        assert_eq!(identity.session_id, "sess_1");
    }
}
