use crate::command::CommandLine;
use crate::error::UnitdError;
use derive_builder::Builder;
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Stop timeout used when none is configured
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A user or group reference as written in configuration.
///
/// `"$SUDO_UID"` defers to an environment variable that is read when the
/// process is started; its value may itself be numeric or a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityRef {
    Id(u32),
    Name(String),
    Env(String),
}

impl FromStr for IdentityRef {
    type Err = UnitdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(UnitdError::configuration("empty user or group"));
        }
        if let Some(var) = s.strip_prefix('$') {
            let var = var.trim_start_matches('{').trim_end_matches('}');
            if var.is_empty() {
                return Err(UnitdError::configuration(format!(
                    "'{s}' does not name an environment variable"
                )));
            }
            return Ok(IdentityRef::Env(var.to_string()));
        }
        match s.parse::<u32>() {
            Ok(id) => Ok(IdentityRef::Id(id)),
            Err(_) => Ok(IdentityRef::Name(s.to_string())),
        }
    }
}

impl From<u32> for IdentityRef {
    fn from(id: u32) -> Self {
        IdentityRef::Id(id)
    }
}

impl fmt::Display for IdentityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityRef::Id(id) => write!(f, "{id}"),
            IdentityRef::Name(name) => f.write_str(name),
            IdentityRef::Env(var) => write!(f, "${var}"),
        }
    }
}

impl<'de> Deserialize<'de> for IdentityRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Id(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Id(id) => Ok(IdentityRef::Id(id)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Immutable launch parameters of one supervised process
#[derive(Debug, Clone, PartialEq, Builder, Deserialize)]
#[builder(setter(into, strip_option), build_fn(validate = "Self::validate"))]
pub struct ProcessSpec {
    pub name: String,
    pub command: String,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub args: Vec<String>,
    #[builder(default)]
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    #[serde(default)]
    pub user: Option<IdentityRef>,
    #[builder(default)]
    #[serde(default)]
    pub group: Option<IdentityRef>,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub exec_start_pre: Vec<CommandLine>,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub exec_start_post: Vec<CommandLine>,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub exec_stop: Vec<CommandLine>,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub exec_stop_post: Vec<CommandLine>,
    #[builder(default = "Signal::SIGTERM")]
    #[serde(default = "default_stop_signal", deserialize_with = "signal_name::deserialize")]
    pub stop_signal: Signal,
    #[builder(default = "true")]
    #[serde(default = "default_send_sigkill")]
    pub send_sigkill: bool,
    #[builder(default)]
    #[serde(default, deserialize_with = "option_duration_secs::deserialize")]
    pub start_timeout: Option<Duration>,
    #[builder(default = "DEFAULT_STOP_TIMEOUT")]
    #[serde(default = "default_stop_timeout", deserialize_with = "duration_secs::deserialize")]
    pub stop_timeout: Duration,
    #[builder(default)]
    #[serde(default)]
    pub log_identifier: Option<String>,
}

impl ProcessSpec {
    pub fn builder() -> ProcessSpecBuilder {
        ProcessSpecBuilder::default()
    }

    /// Tag used to prefix log lines about this process
    pub fn tag(&self) -> &str {
        self.log_identifier.as_deref().unwrap_or(&self.name)
    }

    /// Check the invariants the builder enforces, for specs that came from serde
    pub fn validate(&self) -> Result<(), UnitdError> {
        if self.command.trim().is_empty() {
            return Err(UnitdError::configuration(format!(
                "{}: command must not be empty",
                self.name
            )));
        }
        let hooks = [
            ("exec_start_pre", &self.exec_start_pre),
            ("exec_start_post", &self.exec_start_post),
            ("exec_stop", &self.exec_stop),
            ("exec_stop_post", &self.exec_stop_post),
        ];
        for (field, commands) in hooks {
            if commands.iter().any(CommandLine::is_empty) {
                return Err(UnitdError::configuration(format!(
                    "{}: {field} contains an empty command",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl ProcessSpecBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(BTreeMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(BTreeMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn exec_start_pre<I: IntoIterator<Item = CommandLine>>(&mut self, iter: I) -> &mut Self {
        self.exec_start_pre = Some(iter.into_iter().collect());
        self
    }

    pub fn exec_start_post<I: IntoIterator<Item = CommandLine>>(&mut self, iter: I) -> &mut Self {
        self.exec_start_post = Some(iter.into_iter().collect());
        self
    }

    pub fn exec_stop<I: IntoIterator<Item = CommandLine>>(&mut self, iter: I) -> &mut Self {
        self.exec_stop = Some(iter.into_iter().collect());
        self
    }

    pub fn exec_stop_post<I: IntoIterator<Item = CommandLine>>(&mut self, iter: I) -> &mut Self {
        self.exec_stop_post = Some(iter.into_iter().collect());
        self
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(command) = &self.command
            && command.trim().is_empty()
        {
            return Err("command must not be empty".to_string());
        }
        let hooks = [
            &self.exec_start_pre,
            &self.exec_start_post,
            &self.exec_stop,
            &self.exec_stop_post,
        ];
        if hooks
            .into_iter()
            .flatten()
            .any(|commands| commands.iter().any(CommandLine::is_empty))
        {
            return Err("hook commands must not be empty".to_string());
        }
        Ok(())
    }
}

/// Parse a signal name such as `SIGUSR1` or `USR1`
pub fn parse_signal(name: &str) -> Result<Signal, UnitdError> {
    let name = name.trim().to_ascii_uppercase();
    let full = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{name}")
    };
    Signal::from_str(&full).map_err(|_| UnitdError::configuration(format!("unknown signal '{full}'")))
}

fn default_stop_signal() -> Signal {
    Signal::SIGTERM
}

fn default_send_sigkill() -> bool {
    true
}

fn default_stop_timeout() -> Duration {
    DEFAULT_STOP_TIMEOUT
}

pub(crate) fn seconds_to_duration(seconds: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("invalid duration {seconds}: {e}"))
}

/// Serde adapter for signals written by name
pub mod signal_name {
    use nix::sys::signal::Signal;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Signal, D::Error> {
        let name = String::deserialize(deserializer)?;
        super::parse_signal(&name).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional signals written by name
pub mod option_signal_name {
    use nix::sys::signal::Signal;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Signal>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|name| super::parse_signal(&name).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Serde adapter for durations written as (fractional) seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        super::seconds_to_duration(seconds).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional durations written as (fractional) seconds
pub mod option_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|seconds| super::seconds_to_duration(seconds).map_err(serde::de::Error::custom))
            .transpose()
    }
}
