//! Launch command templates
//!
//! Commands are split on whitespace into an argument vector; nothing goes
//! through a shell. Placeholders are substituted per argument:
//!
//! - `%d` or `{port}`: the port the instance should listen on
//! - `%s` or `{name}`: the container name

use crate::error::LaunchError;
use std::fmt;
use std::str::FromStr;

/// Parsed launch command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    parts: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(command: &str) -> Result<Self, LaunchError> {
        let parts: Vec<String> = strip_quotes(command.trim())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        if parts.is_empty() {
            return Err(LaunchError::InvalidCommand("empty command".to_string()));
        }

        Ok(Self { parts })
    }

    pub fn program(&self) -> &str {
        &self.parts[0]
    }

    pub fn has_port_placeholder(&self) -> bool {
        self.parts
            .iter()
            .any(|p| p.contains("%d") || p.contains("{port}"))
    }

    /// Argument vector with placeholders filled in, program first
    pub fn render(&self, port: u16, name: &str) -> Vec<String> {
        let port = port.to_string();
        self.parts
            .iter()
            .map(|part| {
                part.replace("%d", &port)
                    .replace("{port}", &port)
                    .replace("%s", name)
                    .replace("{name}", name)
            })
            .collect()
    }
}

impl FromStr for CommandTemplate {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parts.join(" "))
    }
}

/// Drop one pair of matching surrounding quotes, as left by env files
fn strip_quotes(command: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = command
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    command
}
