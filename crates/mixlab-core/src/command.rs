//! Container entrypoints as structured `(pre, command, args)` records.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Flag(String),
    Pair(String, String),
}

impl Arg {
    pub fn flag(flag: impl Into<String>) -> Self {
        Arg::Flag(flag.into())
    }

    pub fn pair(flag: impl Into<String>, value: impl fmt::Display) -> Self {
        Arg::Pair(flag.into(), value.to_string())
    }

    pub fn name(&self) -> &str {
        match self {
            Arg::Flag(f) | Arg::Pair(f, _) => f,
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            Arg::Flag(_) => None,
            Arg::Pair(_, v) => Some(v),
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Flag(flag) => f.write_str(flag),
            Arg::Pair(flag, value) => write!(f, "{}={}", flag, value),
        }
    }
}

/// What to do when an added argument's flag is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    #[default]
    Error,
    Ignore,
    Replace,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("argument '{flag}' already present on command '{command}'")]
    DuplicateArg { command: String, flag: String },
    #[error("single_shell command config must hold exactly one command (found {0})")]
    SingleShellArity(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub pre: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<Arg>,
    #[serde(default)]
    pub multiline: bool,
}

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            pre: None,
            command: command.into(),
            args: Vec::new(),
            multiline: false,
        }
    }

    pub fn with_pre(mut self, pre: impl Into<String>) -> Self {
        self.pre = Some(pre.into());
        self
    }

    pub fn multiline(mut self, multiline: bool) -> Self {
        self.multiline = multiline;
        self
    }

    pub fn has_arg(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a.name() == flag)
    }

    /// `None` when the flag is absent, `Some(None)` for a bare flag.
    pub fn find_arg(&self, flag: &str) -> Option<Option<&str>> {
        self.args.iter().find(|a| a.name() == flag).map(Arg::value)
    }

    pub fn add_arg(&mut self, arg: Arg, policy: DuplicatePolicy) -> Result<(), CommandError> {
        self.add_args([arg], policy)
    }

    /// Adds `args` in order. Duplicates are judged against the flags present
    /// before the call, so one call may add several values for one flag.
    pub fn add_args<I>(&mut self, args: I, policy: DuplicatePolicy) -> Result<(), CommandError>
    where
        I: IntoIterator<Item = Arg>,
    {
        let incoming: Vec<Arg> = args.into_iter().collect();
        match policy {
            DuplicatePolicy::Error => {
                if let Some(dup) = incoming.iter().find(|a| self.has_arg(a.name())) {
                    return Err(CommandError::DuplicateArg {
                        command: self.command.clone(),
                        flag: dup.name().to_string(),
                    });
                }
                self.args.extend(incoming);
            }
            DuplicatePolicy::Ignore => {
                let fresh: Vec<Arg> = incoming
                    .into_iter()
                    .filter(|a| !self.has_arg(a.name()))
                    .collect();
                self.args.extend(fresh);
            }
            DuplicatePolicy::Replace => {
                let mut flags: Vec<String> = Vec::new();
                for a in &incoming {
                    if !flags.iter().any(|f| f == a.name()) {
                        flags.push(a.name().to_string());
                    }
                }
                for flag in flags {
                    let replacements: Vec<Arg> = incoming
                        .iter()
                        .filter(|a| a.name() == flag)
                        .cloned()
                        .collect();
                    self.replace_flag(&flag, replacements);
                }
            }
        }
        Ok(())
    }

    fn replace_flag(&mut self, flag: &str, replacements: Vec<Arg>) {
        let first = self.args.iter().position(|a| a.name() == flag);
        self.args.retain(|a| a.name() != flag);
        let at = first.unwrap_or(self.args.len());
        self.args.splice(at..at, replacements);
    }

    pub fn render(&self) -> String {
        let mut head = String::new();
        if let Some(pre) = self.pre.as_deref().filter(|p| !p.is_empty()) {
            head.push_str(pre);
            head.push(' ');
        }
        head.push_str(&self.command);

        let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        if self.multiline {
            // The trailing newline keeps YAML block scalars from chomping the script.
            let mut out = head;
            for arg in &args {
                out.push_str(" \\\n  ");
                out.push_str(arg);
            }
            out.push('\n');
            out
        } else if args.is_empty() {
            head
        } else {
            format!("{} {}", head, args.join(" "))
        }
    }

    /// Exec-form argv: `pre` split on whitespace, the program, then one
    /// token per argument.
    pub fn argv(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .pre
            .as_deref()
            .map(|p| p.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        out.push(self.command.clone());
        out.extend(self.args.iter().map(|a| a.to_string()));
        out
    }
}

/// A rendered entrypoint, ready for a container's `command` and `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entrypoint {
    pub command: Vec<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub single_shell: bool,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            single_shell: false,
            shell: default_shell(),
        }
    }
}

impl CommandConfig {
    pub fn single(command: Command) -> Self {
        Self {
            commands: vec![command],
            single_shell: true,
            shell: default_shell(),
        }
    }

    pub fn find_command(&self, name: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.command == name)
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn prepend(&mut self, command: Command) {
        self.commands.insert(0, command);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn render(&self) -> Result<Entrypoint, CommandError> {
        if self.single_shell {
            let [only] = self.commands.as_slice() else {
                return Err(CommandError::SingleShellArity(self.commands.len()));
            };
            let mut argv = only.argv();
            let args = argv.split_off(argv.len() - only.args.len());
            return Ok(Entrypoint {
                command: argv,
                args,
            });
        }
        let script = self
            .commands
            .iter()
            .map(Command::render)
            .collect::<Vec<_>>()
            .join("\n");
        Ok(Entrypoint {
            command: vec![self.shell.clone(), "-c".to_string()],
            args: vec![script],
        })
    }
}
