//! Equivalent OpenSSH command line for a tunnel configuration
//!
//! Pure formatting: rendering for display/copy, argv for spawning, a batch
//! file export, and the reverse parse used to import an existing
//! `ssh -L ...` invocation.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::types::{ConfigError, ForwardMapping, TunnelConfig};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("SSH command is empty")]
    Empty,

    #[error("Unclosed quote in SSH command")]
    UnclosedQuote,

    #[error("SSH command must include a destination")]
    MissingDestination,

    #[error("Option {0} requires a value")]
    MissingValue(&'static str),

    #[error("Invalid port {0:?}")]
    InvalidPort(String),

    #[error("Invalid forwarding {0:?}, expected local_port:host:remote_port")]
    InvalidForward(String),

    #[error(transparent)]
    Invalid(#[from] ConfigError),

    #[error("Could not write batch file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn destination(config: &TunnelConfig) -> String {
    if config.username.is_empty() {
        config.jump_host.clone()
    } else {
        format!("{}@{}", config.username, config.jump_host)
    }
}

fn key_arg(config: &TunnelConfig) -> Option<String> {
    config
        .expanded_key_path()
        .map(|p| p.to_string_lossy().into_owned())
}

/// `ssh [user@]host [-p N] [-i key] -L l:h:r ... -N`
pub fn render_command(config: &TunnelConfig) -> String {
    let mut out = format!("ssh {}", destination(config));
    if config.jump_port != 22 {
        out.push_str(&format!(" -p {}", config.jump_port));
    }
    if let Some(key) = key_arg(config) {
        out.push_str(&format!(" -i {}", key));
    }
    for mapping in &config.forwardings {
        out.push_str(&format!(" -L {}", mapping));
    }
    out.push_str(" -N");
    out
}

/// Argument vector for spawning `ssh` directly
pub fn command_args(config: &TunnelConfig) -> Vec<String> {
    let mut args = vec!["ssh".to_string(), destination(config), "-N".to_string()];
    if config.jump_port != 22 {
        args.push("-p".into());
        args.push(config.jump_port.to_string());
    }
    if let Some(key) = key_arg(config) {
        args.push("-i".into());
        args.push(key);
    }
    for mapping in &config.forwardings {
        args.push("-L".into());
        args.push(mapping.to_string());
    }
    args
}

/// Write the rendered command to a `.bat` file, appending the extension
/// when missing. Returns the path actually written.
pub async fn export_batch(config: &TunnelConfig, path: &Path) -> Result<PathBuf, CommandError> {
    let path = if path.extension().is_some_and(|ext| ext == "bat") {
        path.to_path_buf()
    } else {
        let mut name = path.as_os_str().to_owned();
        name.push(".bat");
        PathBuf::from(name)
    };

    tokio::fs::write(&path, render_command(config))
        .await
        .map_err(|source| CommandError::Write {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}

/// ssh options whose value is a separate argument we have no use for
const IGNORED_VALUE_OPTIONS: &[&str] = &[
    "-B", "-b", "-c", "-D", "-E", "-e", "-F", "-I", "-J", "-m", "-O", "-o", "-P", "-Q", "-R",
    "-S", "-W", "-w",
];

/// Build a configuration from an `ssh ... -L l:h:r` command line.
///
/// Recognizes `-i`, `-L`, `-l`, `-p` and `-N`. Other options are ignored,
/// along with their values. A user in `user@host` wins over `-l`.
pub fn parse_command(raw: &str) -> Result<TunnelConfig, CommandError> {
    let tokens = split_shell_words(raw)?;
    let mut tokens = tokens.into_iter();
    // Program name
    tokens.next().ok_or(CommandError::Empty)?;

    let mut destination = None;
    let mut port = 22u16;
    let mut key_path = None;
    let mut login = None;
    let mut forwardings = Vec::new();

    while let Some(token) = tokens.next() {
        let mut value_for = |flag: &'static str, joined: &str| -> Result<String, CommandError> {
            if joined.is_empty() {
                tokens.next().ok_or(CommandError::MissingValue(flag))
            } else {
                Ok(joined.to_string())
            }
        };

        if let Some(rest) = token.strip_prefix("-L") {
            forwardings.push(parse_forward(&value_for("-L", rest)?)?);
        } else if let Some(rest) = token.strip_prefix("-p") {
            let value = value_for("-p", rest)?;
            port = value.parse().map_err(|_| CommandError::InvalidPort(value))?;
        } else if let Some(rest) = token.strip_prefix("-i") {
            key_path = Some(value_for("-i", rest)?);
        } else if let Some(rest) = token.strip_prefix("-l") {
            login = Some(value_for("-l", rest)?);
        } else if let Some(flag) = IGNORED_VALUE_OPTIONS.iter().copied().find(|f| *f == token) {
            value_for(flag, "")?;
        } else if token.starts_with('-') {
            // -N and anything unrecognized
        } else if destination.is_none() {
            destination = Some(token);
        }
    }

    let destination = destination.ok_or(CommandError::MissingDestination)?;
    let (username, jump_host) = match destination.split_once('@') {
        Some((user, host)) => (user.to_string(), host.to_string()),
        None => (login.unwrap_or_default(), destination),
    };

    let config = TunnelConfig {
        jump_host,
        username,
        jump_port: port,
        key_path,
        forwardings,
    };
    config.validate()?;
    Ok(config)
}

fn parse_forward(value: &str) -> Result<ForwardMapping, CommandError> {
    let invalid = || CommandError::InvalidForward(value.to_string());
    let mut parts = value.splitn(3, ':');
    let (local, host, remote) = match (parts.next(), parts.next(), parts.next()) {
        (Some(l), Some(h), Some(r)) => (l, h, r),
        _ => return Err(invalid()),
    };
    Ok(ForwardMapping::new(
        local.parse().map_err(|_| invalid())?,
        host,
        remote.parse().map_err(|_| invalid())?,
    ))
}

fn split_shell_words(input: &str) -> Result<Vec<String>, CommandError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;

    for ch in input.chars() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            c if c.is_whitespace() && !in_single && !in_double => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            // Backslashes are kept verbatim so Windows key paths survive
            _ => current.push(ch),
        }
    }

    if in_single || in_double {
        return Err(CommandError::UnclosedQuote);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    if tokens.is_empty() {
        return Err(CommandError::Empty);
    }
    Ok(tokens)
}
