//! Branch command strings.
//!
//! Accepts the `pragma`-style commands understood by other tooling:
//!
//! ```text
//! branch                          branch=NAME[.N]
//! branches                        new_branch=NAME [at SOURCE[.N]]
//! rename_branch OLD NEW           del_branch(NAME)
//! branch_info(NAME)               branch_truncate(NAME.N)
//! branch_merge --forward TARGET SOURCE[.N] [COUNT]
//! branch_log [--strict] [--netstring | --delimited[SEP]] [NAME[.RANGE]]
//!            [--add NAME.N TEXT | --set NAME.N TEXT... | --del NAME.N I...]
//! ```

use crate::branches::split_ref;
use crate::commitlog::{netstring_decode, parse_separator, render, CommitRange, LogEdit, LogFormat};
use crate::connection::Connection;
use crate::error::{Result, StoreError};

/// Result rows of a command.
pub type Rows = Vec<Vec<String>>;

/// A parsed branch command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    CurrentBranch,
    Checkout(String),
    ListBranches,
    NewBranch {
        name: String,
        source: Option<String>,
    },
    RenameBranch {
        old_name: String,
        new_name: String,
    },
    DeleteBranch(String),
    BranchInfo(String),
    Truncate {
        name: String,
        commit: u64,
    },
    MergeForward {
        target: String,
        source: String,
        count: Option<i64>,
    },
    Log {
        target: Option<String>,
        range: CommitRange,
        strict: bool,
        format: LogFormat,
    },
    EditLog(LogEdit),
}

fn invalid(command: &str, why: &str) -> StoreError {
    StoreError::InvalidCommand(format!("{}: {}", why, command.trim()))
}

fn unquote(s: &str) -> &str {
    for q in ['\'', '"'] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Whitespace tokenizer over the argument part of a command.
struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { rest: input }
    }

    fn is_empty(&self) -> bool {
        self.rest.trim().is_empty()
    }

    /// Next whitespace-separated token, honouring `'...'` and `"..."`.
    fn token(&mut self) -> Option<&'a str> {
        let s = self.rest.trim_start();
        if s.is_empty() {
            self.rest = s;
            return None;
        }
        let end = match s.chars().next() {
            Some(q @ ('\'' | '"')) => s[1..].find(q).map_or(s.len(), |i| i + 2),
            _ => s.find(char::is_whitespace).unwrap_or(s.len()),
        };
        let (token, rest) = s.split_at(end);
        self.rest = rest;
        Some(unquote(token))
    }

    /// `--delimited` with whatever separator is attached to it, including a
    /// bracketed one that contains spaces.
    fn delimited_flag(&mut self) -> Option<&'a str> {
        let s = self.rest.trim_start();
        let attached = s.strip_prefix("--delimited")?;
        let end = if attached.starts_with('[') {
            attached.find(']').map_or(attached.len(), |i| i + 1)
        } else {
            attached.find(char::is_whitespace).unwrap_or(attached.len())
        };
        let (sep, rest) = attached.split_at(end);
        self.rest = rest;
        Some(sep)
    }

    /// Everything left, trimmed and unquoted.
    fn remainder(&mut self) -> &'a str {
        let s = unquote(self.rest.trim());
        self.rest = "";
        s
    }

    /// A run of adjacent netstrings.
    fn netstrings(&mut self) -> Result<&'a str> {
        let s = self.rest.trim_start();
        let bytes = s.as_bytes();
        let mut pos = 0;
        loop {
            let digits = bytes[pos..].iter().take_while(|b| b.is_ascii_digit()).count();
            if digits == 0 {
                break;
            }
            let len: usize = s[pos..pos + digits]
                .parse()
                .map_err(|_| StoreError::InvalidArgument("netstring length".into()))?;
            let end = (pos + digits + 1)
                .checked_add(len)
                .ok_or_else(|| StoreError::InvalidArgument("netstring length".into()))?;
            if bytes.get(pos + digits) != Some(&b':') || bytes.get(end) != Some(&b',') {
                return Err(StoreError::InvalidArgument(format!(
                    "malformed netstring at {:?}",
                    &s[pos..]
                )));
            }
            pos = end + 1;
        }
        if pos == 0 {
            return Err(StoreError::InvalidArgument("expected netstrings".into()));
        }
        let (run, rest) = s.split_at(pos);
        self.rest = rest;
        Ok(run)
    }
}

/// `NAME.N` with a mandatory commit.
fn commit_ref(reference: &str) -> Result<(String, u64)> {
    match split_ref(reference)? {
        (name, Some(commit)) => Ok((name.to_string(), commit)),
        (_, None) => Err(StoreError::InvalidArgument(format!(
            "expected NAME.COMMIT, got {:?}",
            reference
        ))),
    }
}

/// Single argument written as `(ARG)`, `=ARG` or ` ARG`.
fn single_arg<'a>(command: &str, args: &'a str) -> Result<&'a str> {
    let args = args.trim();
    let inner = if let Some(inner) = args.strip_prefix('(') {
        inner
            .strip_suffix(')')
            .ok_or_else(|| invalid(command, "unbalanced parenthesis"))?
    } else {
        args.strip_prefix('=').unwrap_or(args)
    };
    let arg = unquote(inner.trim());
    if arg.is_empty() {
        return Err(invalid(command, "missing argument"));
    }
    Ok(arg)
}

impl Command {
    pub fn parse(input: &str) -> Result<Self> {
        let mut text = input.trim().trim_end_matches(';').trim();
        if let Some(head) = text.get(..6).filter(|h| h.eq_ignore_ascii_case("pragma")) {
            let after = &text[head.len()..];
            if after.starts_with(char::is_whitespace) {
                text = after.trim_start();
            }
        }

        let split = text
            .find(|c: char| c == '=' || c == '(' || c.is_whitespace())
            .unwrap_or(text.len());
        let (name, args) = text.split_at(split);

        match name.to_ascii_lowercase().as_str() {
            "branch" => {
                let args = args.trim();
                match args.strip_prefix('=') {
                    Some(reference) => Ok(Command::Checkout(unquote(reference.trim()).to_string())),
                    None if args.is_empty() => Ok(Command::CurrentBranch),
                    None => Err(invalid(input, "expected branch or branch=NAME")),
                }
            }
            "branches" => Ok(Command::ListBranches),
            "new_branch" => Self::parse_new_branch(input, args),
            "rename_branch" => {
                let mut cursor = Cursor::new(args);
                match (cursor.token(), cursor.token(), cursor.is_empty()) {
                    (Some(old_name), Some(new_name), true) => Ok(Command::RenameBranch {
                        old_name: old_name.to_string(),
                        new_name: new_name.to_string(),
                    }),
                    _ => Err(invalid(input, "expected rename_branch OLD NEW")),
                }
            }
            "del_branch" => Ok(Command::DeleteBranch(single_arg(input, args)?.to_string())),
            "branch_info" => Ok(Command::BranchInfo(single_arg(input, args)?.to_string())),
            "branch_truncate" => {
                let (name, commit) = commit_ref(single_arg(input, args)?)?;
                Ok(Command::Truncate { name, commit })
            }
            "branch_merge" => Self::parse_merge(input, args),
            "branch_log" => Self::parse_log(input, args),
            _ => Err(invalid(input, "unknown command")),
        }
    }

    fn parse_new_branch(input: &str, args: &str) -> Result<Self> {
        let args = args
            .trim_start()
            .strip_prefix('=')
            .ok_or_else(|| invalid(input, "expected new_branch=NAME"))?;
        let mut cursor = Cursor::new(args);
        let name = cursor
            .token()
            .ok_or_else(|| invalid(input, "missing branch name"))?
            .to_string();
        let source = match cursor.token() {
            None => None,
            Some(at) if at.eq_ignore_ascii_case("at") => Some(
                cursor
                    .token()
                    .ok_or_else(|| invalid(input, "missing source after 'at'"))?
                    .to_string(),
            ),
            Some(_) => return Err(invalid(input, "expected 'at SOURCE'")),
        };
        if !cursor.is_empty() {
            return Err(invalid(input, "trailing arguments"));
        }
        Ok(Command::NewBranch { name, source })
    }

    fn parse_merge(input: &str, args: &str) -> Result<Self> {
        let mut cursor = Cursor::new(args);
        if cursor.token() != Some("--forward") {
            return Err(invalid(input, "only --forward merges are supported"));
        }
        let (Some(target), Some(source)) = (cursor.token(), cursor.token()) else {
            return Err(invalid(input, "expected TARGET SOURCE"));
        };
        let count = match cursor.token() {
            None => None,
            Some(count) => Some(count.parse::<i64>().map_err(|_| {
                StoreError::InvalidArgument(format!("bad merge count {:?}", count))
            })?),
        };
        if !cursor.is_empty() {
            return Err(invalid(input, "trailing arguments"));
        }
        Ok(Command::MergeForward {
            target: target.to_string(),
            source: source.to_string(),
            count,
        })
    }

    fn parse_log(input: &str, args: &str) -> Result<Self> {
        let mut cursor = Cursor::new(args);
        let mut strict = false;
        let mut format = LogFormat::Rows;
        let mut target: Option<(String, CommitRange)> = None;

        loop {
            if let Some(sep) = cursor.delimited_flag() {
                format = LogFormat::Delimited(parse_separator(sep)?);
                continue;
            }
            let Some(token) = cursor.token() else { break };
            match token {
                "--strict" => strict = true,
                "--netstring" => format = LogFormat::Netstring,
                "--add" | "--set" | "--del" => {
                    let netstring = format == LogFormat::Netstring;
                    return Self::parse_edit(input, token, &mut cursor, netstring)
                        .map(Command::EditLog);
                }
                flag if flag.starts_with("--") => return Err(invalid(input, "unknown flag")),
                _ if target.is_some() => return Err(invalid(input, "more than one branch")),
                reference => {
                    let (name, range) = match reference.split_once('.') {
                        Some((name, range)) => (name, range.parse::<CommitRange>()?),
                        None => (reference, CommitRange::All),
                    };
                    target = Some((name.to_string(), range));
                }
            }
        }

        let (target, range) = match target {
            Some((name, range)) => (Some(name), range),
            None => (None, CommitRange::All),
        };
        Ok(Command::Log {
            target,
            range,
            strict,
            format,
        })
    }

    fn parse_edit(
        input: &str,
        flag: &str,
        cursor: &mut Cursor<'_>,
        netstring: bool,
    ) -> Result<LogEdit> {
        let statements = |cursor: &mut Cursor<'_>| -> Result<Vec<String>> {
            if netstring {
                netstring_decode(cursor.netstrings()?)
            } else {
                match cursor.remainder() {
                    "" => Err(invalid(input, "missing statement text")),
                    text => Ok(vec![text.to_string()]),
                }
            }
        };
        let reference = cursor
            .token()
            .ok_or_else(|| invalid(input, "missing NAME.COMMIT"))?;
        let (branch, commit) = commit_ref(reference)?;

        match flag {
            "--add" => {
                let statements = statements(cursor)?;
                if !cursor.is_empty() {
                    return Err(invalid(input, "trailing arguments"));
                }
                Ok(LogEdit::Add {
                    branch,
                    commit,
                    statements,
                })
            }
            "--set" => {
                let mut entries = vec![(branch, commit, statements(cursor)?)];
                while netstring && !cursor.is_empty() {
                    let reference = cursor
                        .token()
                        .ok_or_else(|| invalid(input, "missing NAME.COMMIT"))?;
                    let (branch, commit) = commit_ref(reference)?;
                    entries.push((branch, commit, statements(cursor)?));
                }
                Ok(LogEdit::Set { entries })
            }
            _ => {
                let mut indices = Vec::new();
                while let Some(token) = cursor.token() {
                    indices.push(token.parse::<usize>().map_err(|_| {
                        StoreError::InvalidArgument(format!("bad statement index {:?}", token))
                    })?);
                }
                if indices.is_empty() {
                    return Err(invalid(input, "missing statement index"));
                }
                Ok(LogEdit::Del {
                    branch,
                    commit,
                    indices,
                })
            }
        }
    }

    /// Run against a connection.
    pub fn run(self, conn: &mut Connection) -> Result<Rows> {
        let ok = || vec![vec!["OK".to_string()]];
        match self {
            Command::CurrentBranch => Ok(vec![vec![conn.current_branch()?]]),
            Command::Checkout(reference) => {
                conn.checkout(&reference)?;
                Ok(Vec::new())
            }
            Command::ListBranches => Ok(conn.branches()?.into_iter().map(|n| vec![n]).collect()),
            Command::NewBranch { name, source } => {
                conn.create_branch(&name, source.as_deref())?;
                Ok(Vec::new())
            }
            Command::RenameBranch { old_name, new_name } => {
                conn.rename_branch(&old_name, &new_name)?;
                Ok(Vec::new())
            }
            Command::DeleteBranch(name) => {
                conn.delete_branch(&name)?;
                Ok(Vec::new())
            }
            Command::BranchInfo(name) => {
                let info = conn.branch_info(&name)?;
                Ok(vec![vec![serde_json::to_string(&info)?]])
            }
            Command::Truncate { name, commit } => {
                conn.truncate_branch(&name, commit)?;
                Ok(ok())
            }
            Command::MergeForward {
                target,
                source,
                count,
            } => {
                conn.merge_forward(&target, &source, count)?;
                Ok(ok())
            }
            Command::Log {
                target,
                range,
                strict,
                format,
            } => {
                let rows = conn.branch_log(target.as_deref(), range, strict)?;
                Ok(render(rows, &format))
            }
            Command::EditLog(edit) => {
                conn.edit_log(&edit)?;
                Ok(ok())
            }
        }
    }
}

impl Connection {
    /// Parse and run a branch command such as `pragma branch=dev`.
    pub fn execute(&mut self, command: &str) -> Result<Rows> {
        Command::parse(command)?.run(self)
    }
}
