//! Hello line grammars and parser.
//!
//! A Hello line is a space-separated sequence of words. Each [`Grammar`]
//! lists the words positionally; the parser tries a role's grammars in
//! order and takes the first whose shape matches exactly.

use std::fmt;

/// Shortest acceptable Hello line, newline included.
pub const MIN_HELLO_LEN: usize = 25;
/// Longest acceptable Hello line, newline included.
pub const MAX_HELLO_LEN: usize = 500;
/// Longest peer name after un-escaping.
pub const MAX_NAME_LEN: usize = 127;

/// Stand-in for a space inside a transmitted name.
const ESCAPED_SPACE: char = '\u{1}';

const PSK_FIELD: &str = "tlspsk=";

/// One positional word of a Hello grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Lit(&'static str),
    Name,
    Version,
    TlsPsk,
}

/// An ordered list of tokens that a Hello line must match word for word.
#[derive(Debug, Clone, Copy)]
pub struct Grammar(pub &'static [Token]);

use Token::{Lit, Name, TlsPsk, Version};

/// Hello sent by a director to a storage or file node.
pub const DIRECTOR_GRAMMARS: &[Grammar] = &[
    Grammar(&[Lit("Hello"), Lit("Director"), Name, Lit("calling"), Version, TlsPsk]),
    Grammar(&[Lit("Hello"), Lit("Director"), Name, Lit("calling"), Version]),
    Grammar(&[Lit("Hello"), Lit("Director"), Name, Lit("calling")]),
];

/// Hello sent by a console to a director.
pub const CONSOLE_GRAMMARS: &[Grammar] = &[
    Grammar(&[Lit("Hello"), Name, Lit("calling"), Version, TlsPsk]),
    Grammar(&[Lit("Hello"), Name, Lit("calling"), Version]),
];

/// Hello sent by a file node opening a job session on a storage node.
pub const FILE_JOB_GRAMMARS: &[Grammar] = &[
    Grammar(&[Lit("Hello"), Lit("Start"), Lit("Job"), Name, Lit("calling"), Version, TlsPsk]),
    Grammar(&[Lit("Hello"), Lit("Start"), Lit("Job"), Name, Lit("calling"), Version]),
    Grammar(&[Lit("Hello"), Lit("Start"), Lit("Job"), Name]),
];

/// Hello sent by a storage node replicating a job to another storage node.
pub const STORAGE_JOB_GRAMMARS: &[Grammar] = &[
    Grammar(&[
        Lit("Hello"),
        Lit("Start"),
        Lit("Storage"),
        Lit("Job"),
        Name,
        Lit("calling"),
        Version,
        TlsPsk,
    ]),
    Grammar(&[
        Lit("Hello"),
        Lit("Start"),
        Lit("Storage"),
        Lit("Job"),
        Name,
        Lit("calling"),
        Version,
    ]),
    Grammar(&[Lit("Hello"), Lit("Start"), Lit("Storage"), Lit("Job"), Name]),
];

/// Fields extracted from a Hello line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Peer name with spaces restored.
    pub name: String,
    /// Protocol version, 0 when absent.
    pub version: u32,
    /// `tlspsk=` flag, `None` when the field was not sent.
    pub tls_psk: Option<bool>,
}

/// Why a Hello line was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloError {
    TooShort { len: usize },
    TooLong { len: usize },
    NoGrammarMatched,
    EmptyName,
    NameTooLong { len: usize },
    InvalidName,
}

impl fmt::Display for HelloError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HelloError::TooShort { len } => {
                write!(f, "line of {} bytes is shorter than {}", len, MIN_HELLO_LEN)
            }
            HelloError::TooLong { len } => {
                write!(f, "line of {} bytes is longer than {}", len, MAX_HELLO_LEN)
            }
            HelloError::NoGrammarMatched => write!(f, "unrecognized Hello format"),
            HelloError::EmptyName => write!(f, "empty peer name"),
            HelloError::NameTooLong { len } => {
                write!(f, "peer name of {} characters exceeds {}", len, MAX_NAME_LEN)
            }
            HelloError::InvalidName => write!(f, "peer name contains control characters"),
        }
    }
}

impl std::error::Error for HelloError {}

impl Grammar {
    /// Match `words` against this grammar.
    fn matches<'a>(&self, words: &[&'a str]) -> Option<RawHello<'a>> {
        if words.len() != self.0.len() {
            return None;
        }

        let mut raw = RawHello::default();
        for (token, word) in self.0.iter().zip(words) {
            match token {
                Lit(expected) => {
                    if *word != *expected {
                        return None;
                    }
                }
                Name => raw.name = Some(*word),
                Version => raw.version = Some(word.parse().ok()?),
                TlsPsk => {
                    let flag: u32 = word.strip_prefix(PSK_FIELD)?.parse().ok()?;
                    raw.tls_psk = Some(flag != 0);
                }
            }
        }
        Some(raw)
    }

    /// Render a Hello line, filling every field this grammar has.
    pub fn render(&self, name: &str, version: u32, tls_psk: bool) -> String {
        let words: Vec<String> = self
            .0
            .iter()
            .map(|token| match token {
                Lit(word) => (*word).to_string(),
                Name => escape_spaces(name),
                Version => version.to_string(),
                TlsPsk => format!("{}{}", PSK_FIELD, u8::from(tls_psk)),
            })
            .collect();
        format!("{}\n", words.join(" "))
    }
}

#[derive(Default)]
struct RawHello<'a> {
    name: Option<&'a str>,
    version: Option<u32>,
    tls_psk: Option<bool>,
}

/// Parse a received Hello line against `grammars`, most specific first.
pub fn parse_hello(line: &str, grammars: &[Grammar]) -> Result<Hello, HelloError> {
    let len = line.len();
    if len < MIN_HELLO_LEN {
        return Err(HelloError::TooShort { len });
    }
    if len > MAX_HELLO_LEN {
        return Err(HelloError::TooLong { len });
    }

    let words: Vec<&str> = line
        .trim_end_matches(['\n', '\r'])
        .split(' ')
        .collect();

    let raw = grammars
        .iter()
        .find_map(|grammar| grammar.matches(&words))
        .ok_or(HelloError::NoGrammarMatched)?;

    let name = unescape_spaces(raw.name.unwrap_or_default());
    validate_name(&name)?;

    Ok(Hello {
        name,
        version: raw.version.unwrap_or(0),
        tls_psk: raw.tls_psk,
    })
}

fn validate_name(name: &str) -> Result<(), HelloError> {
    if name.trim().is_empty() {
        return Err(HelloError::EmptyName);
    }
    let len = name.chars().count();
    if len > MAX_NAME_LEN {
        return Err(HelloError::NameTooLong { len });
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(HelloError::InvalidName);
    }
    Ok(())
}

/// Replace spaces so a name travels as a single word.
pub fn escape_spaces(name: &str) -> String {
    name.replace(' ', &ESCAPED_SPACE.to_string())
}

/// Reverse [`escape_spaces`].
pub fn unescape_spaces(name: &str) -> String {
    name.replace(ESCAPED_SPACE, " ")
}
