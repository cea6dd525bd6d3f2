//! Output encodings for the statement log.

use crate::error::{Result, StoreError};
use crate::types::LogRow;

/// How the statements of one commit are presented.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One row per statement.
    #[default]
    Rows,
    /// One row per commit, statements as `len:text,` units.
    Netstring,
    /// One row per commit, statements joined by a separator.
    Delimited(String),
}

/// Encode statements as concatenated netstrings.
pub fn netstring_encode<S: AsRef<str>>(items: &[S]) -> String {
    let mut out = String::new();
    for item in items {
        let item = item.as_ref();
        out.push_str(&item.len().to_string());
        out.push(':');
        out.push_str(item);
        out.push(',');
    }
    out
}

/// Decode concatenated netstrings. Lengths count UTF-8 bytes.
pub fn netstring_decode(input: &str) -> Result<Vec<String>> {
    let bad = |why: &str| StoreError::InvalidArgument(format!("malformed netstring: {}", why));
    let bytes = input.as_bytes();
    let mut items = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let colon = bytes[pos..]
            .iter()
            .position(|&b| b == b':')
            .map(|i| pos + i)
            .ok_or_else(|| bad("missing ':'"))?;
        let len: usize = input[pos..colon]
            .parse()
            .map_err(|_| bad("length is not a number"))?;
        let start = colon + 1;
        let end = start
            .checked_add(len)
            .filter(|&end| end < bytes.len())
            .ok_or_else(|| bad("length runs past the end"))?;
        if bytes[end] != b',' {
            return Err(bad("missing ','"));
        }
        let item = input
            .get(start..end)
            .ok_or_else(|| bad("length splits a character"))?;
        items.push(item.to_string());
        pos = end + 1;
    }
    Ok(items)
}

/// Decode a `--delimited` separator argument.
///
/// `[text]` is taken literally; otherwise `\n`, `\t`, `\r`, `\\` and `\xHH`
/// escapes are expanded. An empty argument means newline.
pub fn parse_separator(raw: &str) -> Result<String> {
    if raw.is_empty() {
        return Ok("\n".to_string());
    }
    if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        return Ok(inner.to_string());
    }

    let mut out = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                let code = u8::from_str_radix(&hex, 16).ok().filter(|_| hex.len() == 2);
                match code {
                    Some(code) => out.push(code as char),
                    None => {
                        return Err(StoreError::InvalidArgument(format!(
                            "bad \\x escape in separator {:?}",
                            raw
                        )))
                    }
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    Ok(out)
}

/// Shape log rows into result rows `[branch, commit, text]`.
pub fn render(rows: Vec<LogRow>, format: &LogFormat) -> Vec<Vec<String>> {
    if *format == LogFormat::Rows {
        return rows
            .into_iter()
            .map(|r| vec![r.branch, r.commit.to_string(), r.text])
            .collect();
    }

    let mut grouped: Vec<(String, u64, Vec<String>)> = Vec::new();
    for row in rows {
        match grouped.last_mut() {
            Some((branch, commit, texts)) if *branch == row.branch && *commit == row.commit => {
                texts.push(row.text)
            }
            _ => grouped.push((row.branch, row.commit, vec![row.text])),
        }
    }

    grouped
        .into_iter()
        .map(|(branch, commit, texts)| {
            let joined = match format {
                LogFormat::Netstring => netstring_encode(&texts),
                LogFormat::Delimited(sep) => texts.join(sep.as_str()),
                LogFormat::Rows => texts.join("\n"),
            };
            vec![branch, commit.to_string(), joined]
        })
        .collect()
}
