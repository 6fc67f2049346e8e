//! Parsing of uploaded URL lists.
//!
//! Each non-blank line is either `URL` or `URL<TAB>SearchVolume`. Validation
//! is all-or-nothing: any malformed line fails the whole file and every
//! offending line is reported.

use crate::model::UrlEntry;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputErrors(pub Vec<LineError>);

impl InputErrors {
    pub fn lines(&self) -> &[LineError] {
        &self.0
    }
}

impl fmt::Display for InputErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{} malformed line(s): {}", self.0.len(), joined)
    }
}

impl std::error::Error for InputErrors {}

pub fn parse_input(text: &str) -> Result<Vec<UrlEntry>, InputErrors> {
    let mut entries = Vec::new();
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        match parse_line(line) {
            Ok(entry) => {
                if seen.insert(entry.url.clone()) {
                    entries.push(entry);
                } else {
                    log::warn!("Skipping duplicate URL on line {}: {}", line_no, entry.url);
                }
            }
            Err(message) => errors.push(LineError {
                line: line_no,
                message,
            }),
        }
    }

    if errors.is_empty() {
        Ok(entries)
    } else {
        Err(InputErrors(errors))
    }
}

fn parse_line(line: &str) -> Result<UrlEntry, String> {
    let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
    let (url, volume) = match fields.as_slice() {
        [url] => (*url, None),
        [url, volume] => (*url, Some(*volume)),
        _ => return Err(format!("expected URL<TAB>SearchVolume, found {} fields", fields.len())),
    };

    let parsed = url::Url::parse(url).map_err(|e| format!("invalid URL '{}': {}", url, e))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("unsupported URL scheme '{}'", parsed.scheme()));
    }

    let search_volume = match volume {
        None | Some("") => 0,
        Some(v) => v
            .parse::<u64>()
            .map_err(|_| format!("invalid search volume '{}'", v))?,
    };

    Ok(UrlEntry::new(url, search_volume))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_tab_separated_and_bare_lines() {
        let text = "https://a.example/search?q=one\t1200\n\n  https://b.example/?q=two  \r\n";
        let entries = parse_input(text).unwrap();
        assert_eq!(
            entries,
            vec![
                UrlEntry::new("https://a.example/search?q=one", 1200),
                UrlEntry::new("https://b.example/?q=two", 0),
            ]
        );
    }

    #[test]
    fn test_rejects_non_numeric_volume_with_line_number() {
        let text = "https://a.example/\t10\nhttps://b.example/\tnot-a-number\n";
        let err = parse_input(text).unwrap_err();
        assert_eq!(err.lines().len(), 1);
        assert_eq!(err.lines()[0].line, 2);
        assert!(err.lines()[0].message.contains("not-a-number"));
    }

    #[test]
    fn test_collects_every_bad_line() {
        let text = "nonsense\nhttps://ok.example/\t5\nftp://files.example/\t1\nhttps://x.example/\t-3\na\tb\tc";
        let err = parse_input(text).unwrap_err();
        let lines: Vec<usize> = err.lines().iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![1, 3, 4, 5]);
    }

    #[test]
    fn test_duplicates_keep_first() {
        let text = "https://a.example/\t1\nhttps://a.example/\t2";
        let entries = parse_input(text).unwrap();
        assert_eq!(entries, vec![UrlEntry::new("https://a.example/", 1)]);
    }
}
