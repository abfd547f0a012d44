use crate::error::UnitdError;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// A hook command line.
///
/// A leading `-` on the program name means a non-zero exit status is not
/// treated as a failure; the prefix is stripped before execution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawCommandLine")]
pub struct CommandLine {
    argv: Vec<String>,
    ignore_failure: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl TryFrom<RawCommandLine> for CommandLine {
    type Error = UnitdError;

    fn try_from(raw: RawCommandLine) -> Result<Self, Self::Error> {
        match raw {
            RawCommandLine::Shell(line) => line.parse(),
            RawCommandLine::Argv(argv) => Ok(CommandLine::from_words(argv)),
        }
    }
}

impl CommandLine {
    /// Build a command line from already split words, honouring the `-` prefix
    pub fn from_words<S: Into<String>, I: IntoIterator<Item = S>>(words: I) -> Self {
        let mut argv: Vec<String> = words.into_iter().map(Into::into).collect();
        let mut ignore_failure = false;
        if let Some(first) = argv.first_mut() {
            let stripped = first.trim_start_matches('-');
            if stripped.len() != first.len() {
                ignore_failure = true;
                *first = stripped.to_string();
            }
        }
        Self {
            argv,
            ignore_failure,
        }
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }

    pub fn ignore_failure(&self) -> bool {
        self.ignore_failure
    }

    pub fn is_empty(&self) -> bool {
        self.program().is_empty()
    }
}

/// Splits the line into words with POSIX shell quoting rules
impl FromStr for CommandLine {
    type Err = UnitdError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words = shell_words::split(line)
            .map_err(|e| UnitdError::configuration(format!("cannot parse command '{line}': {e}")))?;
        Ok(CommandLine::from_words(words))
    }
}

impl TryFrom<&str> for CommandLine {
    type Error = UnitdError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        line.parse()
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&shell_words::join(&self.argv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> CommandLine {
        line.parse().unwrap()
    }

    #[test]
    fn test_shell_quoting() {
        assert_eq!(parse("xset -dpms").args(), ["-dpms"]);
        let command = parse("sh -c 'echo hello world'");
        assert_eq!(command.program(), "sh");
        assert_eq!(command.args(), ["-c", "echo hello world"]);
        assert_eq!(
            parse(r#"printf "a \"quoted\" word""#).args(),
            [r#"a "quoted" word"#]
        );
        assert_eq!(parse("echo ''").args(), [""]);
    }

    #[test]
    fn test_unterminated_quote_is_rejected() {
        let error = "sh -c 'echo unterminated".parse::<CommandLine>().unwrap_err();
        assert!(matches!(error, UnitdError::ConfigurationError(_)));
        assert!(CommandLine::try_from("printf \"open").is_err());
    }

    #[test]
    fn test_ignore_failure_prefix() {
        let command = parse("-rm /tmp/.X99-lock");
        assert!(command.ignore_failure());
        assert_eq!(command.program(), "rm");
        assert_eq!(command.args(), ["/tmp/.X99-lock"]);

        let command = parse("rm -f /tmp/.X99-lock");
        assert!(!command.ignore_failure());
        assert_eq!(command.args(), ["-f", "/tmp/.X99-lock"]);
    }

    #[test]
    fn test_empty_command() {
        assert!(parse("").is_empty());
        assert!(parse("   ").is_empty());
        assert!(CommandLine::from_words(Vec::<String>::new()).args().is_empty());
    }

    #[test]
    fn test_deserialize_string_or_list() {
        let from_string: CommandLine = serde_json::from_str("\"-xhost +local:\"").unwrap();
        let from_list: CommandLine = serde_json::from_str("[\"-xhost\", \"+local:\"]").unwrap();
        assert_eq!(from_string, from_list);
        assert!(from_list.ignore_failure());
    }

    #[test]
    fn test_deserialize_rejects_unterminated_quote() {
        let result = serde_json::from_str::<CommandLine>(r#""sh -c 'oops""#);
        assert!(result.unwrap_err().to_string().contains("cannot parse command"));
    }

    #[test]
    fn test_display_quotes_when_needed() {
        let command = CommandLine::from_words(["sh", "-c", "sleep 1"]);
        assert_eq!(command.to_string(), "sh -c 'sleep 1'");
    }
}
