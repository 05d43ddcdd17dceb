//! Command line and console input parsing.

use std::path::PathBuf;

use anyhow::{bail, Context};

pub const USAGE: &str = "\
Usage: perfkit-monitor [HOST:PORT] [--id ID --password PW] [--config FILE]

Console commands:
  /classes            list tracer classes
  /trace CLASS on|off toggle periodic fetching of a class
  /nodes CLASS        print the latest node values of a class
  /config             list mirrored config classes
  /set CLASS KEY JSON request a new config value
  /quit               close the session and exit
Any other line is sent to the remote shell.";

/// Parsed command line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Args {
    pub address: Option<String>,
    pub id: Option<String>,
    pub password: Option<String>,
    pub config: Option<PathBuf>,
    pub help: bool,
}

impl Args {
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Self> {
        let mut parsed = Args::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--id" => parsed.id = Some(args.next().context("--id needs a value")?),
                "--password" => {
                    parsed.password = Some(args.next().context("--password needs a value")?)
                }
                "--config" => {
                    parsed.config = Some(args.next().context("--config needs a value")?.into())
                }
                "-h" | "--help" => parsed.help = true,
                flag if flag.starts_with("--") => bail!("unknown option: {flag}"),
                other if parsed.address.is_none() => parsed.address = Some(other.to_string()),
                other => bail!("unexpected argument: {other}"),
            }
        }

        if parsed.id.is_some() != parsed.password.is_some() {
            bail!("--id and --password must be given together");
        }
        Ok(parsed)
    }

    /// Login credentials, when both were given.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.id.as_deref()?, self.password.as_deref()?))
    }
}

/// One line typed at the console.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Shell(String),
    Classes,
    Trace { class: String, enable: bool },
    Nodes(String),
    Config,
    Set { class: String, key: u64, value: serde_json::Value },
    Quit,
    Help,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(ConsoleCommand::Shell(line.to_string()));
        };

        let mut words = rest.splitn(4, ' ').filter(|w| !w.is_empty());
        let command = words.next().unwrap_or_default();
        let parsed = match command {
            "classes" => ConsoleCommand::Classes,
            "config" => ConsoleCommand::Config,
            "quit" | "exit" => ConsoleCommand::Quit,
            "help" => ConsoleCommand::Help,
            "nodes" => {
                ConsoleCommand::Nodes(words.next().context("usage: /nodes CLASS")?.to_string())
            }
            "trace" => {
                let class = words.next().context("usage: /trace CLASS on|off")?;
                let enable = match words.next() {
                    Some("on") | None => true,
                    Some("off") => false,
                    Some(other) => bail!("expected on|off, got {other}"),
                };
                ConsoleCommand::Trace {
                    class: class.to_string(),
                    enable,
                }
            }
            "set" => {
                let class = words.next().context("usage: /set CLASS KEY JSON")?;
                let key = words
                    .next()
                    .context("usage: /set CLASS KEY JSON")?
                    .parse()
                    .context("KEY must be an unsigned integer")?;
                let value = words.next().context("usage: /set CLASS KEY JSON")?;
                ConsoleCommand::Set {
                    class: class.to_string(),
                    key,
                    value: serde_json::from_str(value).context("value must be JSON")?,
                }
            }
            other => bail!("unknown command: /{other}"),
        };
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        Args::parse(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_full_args() {
        let parsed = args(&[
            "10.0.0.7:25572",
            "--id",
            "admin",
            "--password",
            "pw",
            "--config",
            "m.yaml",
        ])
        .unwrap();
        assert_eq!(parsed.address.as_deref(), Some("10.0.0.7:25572"));
        assert_eq!(parsed.credentials(), Some(("admin", "pw")));
        assert_eq!(parsed.config, Some(PathBuf::from("m.yaml")));
    }

    #[test]
    fn test_parse_no_args() {
        let parsed = args(&[]).unwrap();
        assert_eq!(parsed, Args::default());
        assert!(parsed.credentials().is_none());
    }

    #[test]
    fn test_id_requires_password() {
        assert!(args(&["--id", "admin"]).is_err());
    }

    #[test]
    fn test_missing_option_value() {
        assert!(args(&["--config"]).is_err());
    }

    #[test]
    fn test_unknown_option() {
        assert!(args(&["--verbose"]).is_err());
    }

    #[test]
    fn test_console_shell_line() {
        assert_eq!(
            ConsoleCommand::parse("stats frame").unwrap(),
            ConsoleCommand::Shell("stats frame".to_string())
        );
    }

    #[test]
    fn test_console_trace_toggle() {
        assert_eq!(
            ConsoleCommand::parse("/trace frame off").unwrap(),
            ConsoleCommand::Trace {
                class: "frame".to_string(),
                enable: false
            }
        );
        assert_eq!(
            ConsoleCommand::parse("/trace frame").unwrap(),
            ConsoleCommand::Trace {
                class: "frame".to_string(),
                enable: true
            }
        );
    }

    #[test]
    fn test_console_set() {
        assert_eq!(
            ConsoleCommand::parse("/set render 2 {\"w\": 4096}").unwrap(),
            ConsoleCommand::Set {
                class: "render".to_string(),
                key: 2,
                value: json!({"w": 4096}),
            }
        );
        assert!(ConsoleCommand::parse("/set render two 1").is_err());
    }

    #[test]
    fn test_console_unknown_command() {
        assert!(ConsoleCommand::parse("/frobnicate").is_err());
    }
}
