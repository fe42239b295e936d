use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Args;

use crate::{editor::EditorConfig, process::ProcessCommand};

pub const DEFAULT_HOOK_PORT: u16 = 17845;
pub const DEFAULT_API_BASE_URL: &str = "https://api.telegram.org";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0} (flag, environment or env file)")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to read env file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Args, Clone)]
pub struct Config {
    /// Telegram bot token.
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub bot_token: Option<String>,

    /// The single chat allowed to receive alarms and drive sessions.
    #[arg(long, env = "TELEGRAM_CHAT_ID")]
    pub chat_id: Option<String>,

    /// KEY=VALUE file consulted for settings not given as flags or env vars.
    /// Defaults to ~/.claude/telegram.env.
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    #[arg(long, env = "RELAY_HOOK_PORT", default_value_t = DEFAULT_HOOK_PORT)]
    pub port: u16,

    /// Assistant command line; inline arguments are allowed ("claude --model opus").
    #[arg(long, env = "RELAY_CLAUDE_BIN", default_value = "claude")]
    pub claude_bin: String,

    #[arg(long, default_value_t = 1500)]
    pub edit_interval_ms: u64,

    #[arg(long, default_value_t = 20)]
    pub min_edit_growth: usize,

    #[arg(long, default_value_t = 4000)]
    pub max_message_len: usize,

    /// Automation command that opens a remote-control session in the terminal.
    #[arg(long, env = "RELAY_RC_COMMAND")]
    pub rc_command: Option<String>,

    #[arg(long, default_value_t = 6000)]
    pub rc_wait_ms: u64,

    #[arg(long, default_value = DEFAULT_API_BASE_URL)]
    pub api_base_url: String,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit one JSON line per relay lifecycle event on stderr.
    #[arg(long, default_value_t = false)]
    pub json_events: bool,
}

/// Fully validated runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bot_token: String,
    pub chat_id: i64,
    pub port: u16,
    pub claude: ProcessCommand,
    pub editor: EditorConfig,
    pub rc_command: Option<ProcessCommand>,
    pub rc_wait: Duration,
    pub api_base_url: String,
}

impl Config {
    pub fn resolve(&self) -> Result<Settings, ConfigError> {
        let file_values = match &self.env_file {
            Some(path) => read_env_file(path)?,
            None => match default_env_file() {
                Some(path) if path.is_file() => read_env_file(&path)?,
                _ => HashMap::new(),
            },
        };
        self.resolve_with(&file_values)
    }

    fn resolve_with(&self, file_values: &HashMap<String, String>) -> Result<Settings, ConfigError> {
        let lookup = |flag: &Option<String>, key: &str| {
            flag.as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned)
                .or_else(|| {
                    file_values
                        .get(key)
                        .map(|value| value.trim().to_string())
                        .filter(|value| !value.is_empty())
                })
        };

        let bot_token = lookup(&self.bot_token, "TELEGRAM_BOT_TOKEN")
            .ok_or(ConfigError::Missing("TELEGRAM_BOT_TOKEN"))?;
        let chat_id_raw = lookup(&self.chat_id, "TELEGRAM_CHAT_ID")
            .ok_or(ConfigError::Missing("TELEGRAM_CHAT_ID"))?;
        let chat_id = chat_id_raw
            .parse::<i64>()
            .map_err(|error| ConfigError::Invalid {
                key: "TELEGRAM_CHAT_ID",
                reason: error.to_string(),
            })?;

        let claude = parse_command_line(&self.claude_bin).ok_or_else(|| ConfigError::Invalid {
            key: "claude-bin",
            reason: format!("cannot parse command '{}'", self.claude_bin),
        })?;
        let rc_command = match lookup(&self.rc_command, "RELAY_RC_COMMAND") {
            Some(raw) => Some(parse_command_line(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "rc-command",
                reason: format!("cannot parse command '{raw}'"),
            })?),
            None => None,
        };

        if self.max_message_len == 0 {
            return Err(ConfigError::Invalid {
                key: "max-message-len",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Settings {
            bot_token,
            chat_id,
            port: self.port,
            claude,
            editor: EditorConfig {
                interval: Duration::from_millis(self.edit_interval_ms),
                min_growth: self.min_edit_growth,
                max_len: self.max_message_len,
            },
            rc_command,
            rc_wait: Duration::from_millis(self.rc_wait_ms),
            api_base_url: self.api_base_url.trim_end_matches('/').to_string(),
        })
    }
}

pub fn default_env_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("telegram.env"))
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::EnvFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_env_lines(&content))
}

pub fn parse_env_lines(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .collect()
}

/// Split a command string into program and inline arguments.
pub fn parse_command_line(raw: &str) -> Option<ProcessCommand> {
    let mut words = shlex::split(raw.trim())?;
    if words.is_empty() {
        return None;
    }
    let program = words.remove(0);
    Some(ProcessCommand {
        program,
        args: words,
    })
}
