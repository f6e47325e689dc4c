//! Tagged-section model of an OpenSSH client configuration file.
//!
//! A document is an optional preamble followed by sections. Each section starts
//! at a `Host <pattern>...` line and runs until the next one. Comment lines
//! written directly above a `Host` line (starting in column zero, no blank line
//! in between) belong to that section as its leading comments, which is where
//! the managed marker lives. A marked section's leading comments start at the
//! marker line; comments above it stay with the block before.
//!
//! Parsing never fails: anything that isn't a `Host` line is kept verbatim in
//! the preamble or in the body of the section it follows. The line ending of
//! the first line (LF or CRLF) is used for the whole document on output.

use std::fmt;

/// Token written into the leading comment of every generated section.
pub const MANAGED_MARKER: &str = "nodelink:managed";

/// One `Host` block with its raw lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSection {
    /// Comment lines directly above the `Host` line
    pub leading: Vec<String>,
    /// The raw `Host ...` line
    pub header: String,
    /// Host patterns named on the header line
    pub patterns: Vec<String>,
    /// Directive lines, blank lines and indented comments following the header
    pub body: Vec<String>,
    /// True if one of the patterns is the catch-all `*`
    pub is_wildcard: bool,
    /// True if the leading comments carry [`MANAGED_MARKER`]
    pub managed: bool,
}

impl ConfigSection {
    /// Build a section from its parts, deriving the wildcard and managed flags.
    pub fn new(leading: Vec<String>, header: String, patterns: Vec<String>, body: Vec<String>) -> Self {
        let is_wildcard = patterns.iter().any(|p| p == "*");
        let managed = leading.iter().any(|l| l.contains(MANAGED_MARKER));
        Self {
            leading,
            header,
            patterns,
            body,
            is_wildcard,
            managed,
        }
    }

    /// Parse the host patterns out of a `Host` line.
    ///
    /// Accepts `Host a b`, `host a`, and `Host=a`. Returns `None` for any other
    /// line, including a `Host` keyword with no patterns.
    pub fn parse_header(line: &str) -> Option<Vec<String>> {
        let trimmed = line.trim_start();
        let keyword_end = trimmed
            .find(|c: char| c.is_whitespace() || c == '=')
            .unwrap_or(trimmed.len());
        if !trimmed[..keyword_end].eq_ignore_ascii_case("host") {
            return None;
        }

        let rest = trimmed[keyword_end..].trim_start();
        let rest = rest.strip_prefix('=').unwrap_or(rest);
        let patterns: Vec<String> = rest
            .split_whitespace()
            .map(|p| p.trim_matches('"').to_string())
            .filter(|p| !p.is_empty())
            .collect();

        if patterns.is_empty() {
            None
        } else {
            Some(patterns)
        }
    }

    /// Whether this section names `alias` as one of its patterns.
    pub fn defines(&self, alias: &str) -> bool {
        self.patterns.iter().any(|p| p == alias)
    }

    /// Whether this section is exactly `Host <alias>`.
    pub fn is_exactly(&self, alias: &str) -> bool {
        self.patterns.len() == 1 && self.patterns[0] == alias
    }

    /// Value of the first directive named `key` (case-insensitive).
    pub fn directive(&self, key: &str) -> Option<&str> {
        self.body.iter().find_map(|line| {
            let line = line.trim();
            let (name, value) = line.split_once(|c: char| c.is_whitespace() || c == '=')?;
            if name.eq_ignore_ascii_case(key) {
                Some(value.trim_start_matches(|c: char| c.is_whitespace() || c == '=').trim())
            } else {
                None
            }
        })
    }

    /// All raw lines of this section in file order.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.leading
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.header.as_str()))
            .chain(self.body.iter().map(String::as_str))
    }

    /// Drop blank lines at the end of the body.
    pub fn trim_trailing_blank(&mut self) {
        trim_trailing_blank(&mut self.body);
    }
}

/// Line terminator written when serializing a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LineEnding {
    #[default]
    Lf,
    CrLf,
}

impl LineEnding {
    /// Line ending of the first line in `text`; LF if there is none.
    pub fn detect(text: &str) -> Self {
        match text.find('\n') {
            Some(end) if text[..end].ends_with('\r') => LineEnding::CrLf,
            _ => LineEnding::Lf,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

/// An ordered sequence of sections plus whatever precedes the first one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    /// Lines before the first section (header comments, global directives)
    pub preamble: Vec<String>,
    pub sections: Vec<ConfigSection>,
    pub line_ending: LineEnding,
}

impl ConfigDocument {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse raw file content into sections.
    pub fn parse(text: &str) -> Self {
        let mut doc = Self {
            line_ending: LineEnding::detect(text),
            ..Self::new()
        };

        for line in text.lines() {
            match ConfigSection::parse_header(line) {
                Some(patterns) => {
                    let previous = match doc.sections.last_mut() {
                        Some(section) => &mut section.body,
                        None => &mut doc.preamble,
                    };
                    let split = leading_comment_start(previous);
                    let leading = previous.split_off(split);
                    doc.sections
                        .push(ConfigSection::new(leading, line.to_string(), patterns, Vec::new()));
                }
                None => match doc.sections.last_mut() {
                    Some(section) => section.body.push(line.to_string()),
                    None => doc.preamble.push(line.to_string()),
                },
            }
        }

        doc
    }

    /// True if the document has no sections and nothing but blank lines.
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty() && self.preamble.iter().all(|l| l.trim().is_empty())
    }

    /// Index of the first catch-all section, if any.
    pub fn first_wildcard(&self) -> Option<usize> {
        self.sections.iter().position(|s| s.is_wildcard)
    }

    /// All sections that name `alias`.
    pub fn sections_defining<'a>(&'a self, alias: &'a str) -> impl Iterator<Item = &'a ConfigSection> {
        self.sections.iter().filter(move |s| s.defines(alias))
    }

    /// Normalize blank lines at section boundaries.
    ///
    /// Trailing blank lines are trimmed from the preamble and every section,
    /// then exactly one blank line is placed between consecutive blocks.
    /// Blank lines inside a section body are left alone.
    pub fn tidy_boundaries(&mut self) {
        trim_trailing_blank(&mut self.preamble);
        for section in &mut self.sections {
            section.trim_trailing_blank();
        }

        if !self.preamble.is_empty() && !self.sections.is_empty() {
            self.preamble.push(String::new());
        }
        let count = self.sections.len();
        for section in self.sections.iter_mut().take(count.saturating_sub(1)) {
            section.body.push(String::new());
        }
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = self
            .preamble
            .iter()
            .map(String::as_str)
            .chain(self.sections.iter().flat_map(|s| s.lines()));
        let ending = self.line_ending.as_str();
        for line in lines {
            write!(f, "{}{}", line, ending)?;
        }
        Ok(())
    }
}

/// Position where the leading comments of the next section start.
///
/// That is the trailing run of column-zero comments, cut at the managed
/// marker if the run contains one.
fn leading_comment_start(lines: &[String]) -> usize {
    let mut start = lines.len();
    while start > 0 && lines[start - 1].starts_with('#') {
        start -= 1;
    }
    match lines[start..].iter().position(|l| l.contains(MANAGED_MARKER)) {
        Some(offset) => start + offset,
        None => start,
    }
}

fn trim_trailing_blank(lines: &mut Vec<String>) {
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
}
