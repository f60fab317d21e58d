//! Tokenizer for the DHCP configuration language.
//!
//! The language is line oriented: `#` starts a comment that runs to the end
//! of the line, newlines are significant ([`TokenKind::Eol`]) and blocks are
//! closed with the `end` keyword. Commas and blanks separate values.
//!
//! Numeric runs are classified by shape: `10` is a number, `10.0.0.1` an
//! address and `10.0.0.0/24` a CIDR block, which is emitted as the network
//! address followed by a synthetic netmask token so the parser can treat
//! `subnet 10.0.0.0/24` and `subnet 10.0.0.0 255.255.255.0` alike.
//!
//! Included files are handled with an explicit stack of sources. When an
//! included source is exhausted it is popped and an [`TokenKind::Eol`] is
//! emitted so a final line without a trailing newline never runs into the
//! including file.

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;

/// Deepest include nesting accepted before the configuration is rejected.
pub const MAX_INCLUDE_DEPTH: usize = 16;

/// Reserved words of the configuration language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    End,
    Global,
    Network,
    Subnet,
    Pool,
    Registered,
    Unregistered,
    ServerIdentifier,
    Range,
    Include,
    Local,
    IgnoreRegistration,
    DeclOption,
    Code,
    Type,
    Option,
    FreeLeaseAfter,
    DefaultLeaseTime,
    MaxLeaseTime,
}

const KEYWORDS: &[(&str, Keyword)] = &[
    ("end", Keyword::End),
    ("global", Keyword::Global),
    ("network", Keyword::Network),
    ("subnet", Keyword::Subnet),
    ("pool", Keyword::Pool),
    ("registered", Keyword::Registered),
    ("unregistered", Keyword::Unregistered),
    ("server-identifier", Keyword::ServerIdentifier),
    ("range", Keyword::Range),
    ("include", Keyword::Include),
    ("local", Keyword::Local),
    ("ignore-registration", Keyword::IgnoreRegistration),
    ("decloption", Keyword::DeclOption),
    ("code", Keyword::Code),
    ("type", Keyword::Type),
    ("option", Keyword::Option),
    ("free-lease-after", Keyword::FreeLeaseAfter),
    ("default-lease-time", Keyword::DefaultLeaseTime),
    ("max-lease-time", Keyword::MaxLeaseTime),
];

impl Keyword {
    pub fn lookup(ident: &str) -> Option<Self> {
        KEYWORDS
            .iter()
            .find(|(name, _)| *name == ident)
            .map(|(_, keyword)| *keyword)
    }

    pub fn as_str(self) -> &'static str {
        KEYWORDS
            .iter()
            .find(|(_, keyword)| *keyword == self)
            .map(|(name, _)| *name)
            .unwrap_or("?")
    }

    /// Keywords that begin a setting line inside any settings block.
    pub fn is_setting(self) -> bool {
        matches!(
            self,
            Self::Option | Self::FreeLeaseAfter | Self::DefaultLeaseTime | Self::MaxLeaseTime
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Input that does not form any valid literal.
    Illegal(String),
    Eof,
    Comment(String),
    Eol,
    Number(i64),
    /// A quoted string or a bare identifier that is not a keyword.
    String(String),
    IpAddress(Ipv4Addr),
    Boolean(bool),
    Keyword(Keyword),
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Illegal(text) => write!(f, "illegal input '{}'", text),
            Self::Eof => write!(f, "end of file"),
            Self::Comment(_) => write!(f, "comment"),
            Self::Eol => write!(f, "end of line"),
            Self::Number(value) => write!(f, "number {}", value),
            Self::String(value) => write!(f, "string \"{}\"", value),
            Self::IpAddress(ip) => write!(f, "address {}", ip),
            Self::Boolean(value) => write!(f, "boolean {}", value),
            Self::Keyword(keyword) => write!(f, "keyword '{}'", keyword.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

#[derive(Debug)]
struct Source {
    name: String,
    dir: Option<PathBuf>,
    data: Vec<u8>,
    pos: usize,
    line: usize,
}

impl Source {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
        }
        Some(byte)
    }

    fn take_while(&mut self, keep: impl Fn(u8) -> bool) -> String {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if !keep(byte) {
                break;
            }
            self.bump();
        }
        String::from_utf8_lossy(&self.data[start..self.pos]).into_owned()
    }
}

/// Streaming tokenizer with single-token pushback and nested sources.
#[derive(Debug)]
pub struct Lexer {
    sources: Vec<Source>,
    pending: VecDeque<Token>,
    last: Option<Token>,
    replay: bool,
    last_line: usize,
}

impl Lexer {
    pub fn new(name: impl Into<String>, text: impl Into<Vec<u8>>) -> Self {
        let mut lexer = Self {
            sources: Vec::new(),
            pending: VecDeque::new(),
            last: None,
            replay: false,
            last_line: 1,
        };
        lexer.sources.push(Source {
            name: name.into(),
            dir: None,
            data: text.into(),
            pos: 0,
            line: 1,
        });
        lexer
    }

    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let data = std::fs::read(path)?;
        let mut lexer = Self::new(path.display().to_string(), data);
        if let Some(source) = lexer.sources.last_mut() {
            source.dir = path.parent().map(Path::to_path_buf);
        }
        Ok(lexer)
    }

    /// Name of the source currently being read.
    pub fn source_name(&self) -> &str {
        self.sources
            .last()
            .map(|source| source.name.as_str())
            .unwrap_or("<input>")
    }

    /// Line of the most recently returned token.
    pub fn line(&self) -> usize {
        self.last_line
    }

    /// Returns the next token. Comments and line ends are not skipped.
    pub fn next(&mut self) -> Token {
        if self.replay {
            self.replay = false;
            if let Some(token) = self.last.clone() {
                self.last_line = token.line;
                return token;
            }
        }

        let token = match self.pending.pop_front() {
            Some(token) => token,
            None => self.scan(),
        };
        self.last_line = token.line;
        self.last = Some(token.clone());
        token
    }

    /// Makes the most recently returned token come back on the next call.
    ///
    /// Only one token of pushback exists; calling this twice in a row has
    /// the same effect as calling it once.
    pub fn unread(&mut self) {
        if self.last.is_some() {
            self.replay = true;
        }
    }

    /// Collects the remaining tokens of the current line, skipping comments.
    ///
    /// The terminating [`TokenKind::Eol`] is consumed. An [`TokenKind::Eof`]
    /// is pushed back so the caller's block loop still sees it.
    pub fn rest_of_line(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next();
            match token.kind {
                TokenKind::Eol => break,
                TokenKind::Eof => {
                    self.unread();
                    break;
                }
                TokenKind::Comment(_) => {}
                _ => tokens.push(token),
            }
        }
        tokens
    }

    /// Starts reading from an included file.
    ///
    /// Relative paths resolve against the directory of the file that
    /// contains the `include`.
    pub fn push_reader(&mut self, path: &str) -> Result<(), String> {
        if self.sources.len() > MAX_INCLUDE_DEPTH {
            return Err(format!(
                "includes nested deeper than {} levels",
                MAX_INCLUDE_DEPTH
            ));
        }

        let requested = Path::new(path);
        let resolved = match self.sources.last().and_then(|source| source.dir.as_ref()) {
            Some(dir) if requested.is_relative() => dir.join(requested),
            _ => requested.to_path_buf(),
        };

        let data = std::fs::read(&resolved)
            .map_err(|error| format!("cannot include {}: {}", resolved.display(), error))?;

        self.sources.push(Source {
            name: resolved.display().to_string(),
            dir: resolved.parent().map(Path::to_path_buf),
            data,
            pos: 0,
            line: 1,
        });
        Ok(())
    }

    /// Abandons the current included source and resumes its parent.
    ///
    /// Returns false when only the top-level source is left.
    pub fn pop_reader(&mut self) -> bool {
        if self.sources.len() > 1 {
            self.sources.pop();
            true
        } else {
            false
        }
    }

    fn scan(&mut self) -> Token {
        loop {
            let Some(source) = self.sources.last_mut() else {
                return Token {
                    kind: TokenKind::Eof,
                    line: self.last_line,
                };
            };
            let line = source.line;

            let Some(byte) = source.peek() else {
                if self.pop_reader() {
                    return Token {
                        kind: TokenKind::Eol,
                        line,
                    };
                }
                return Token {
                    kind: TokenKind::Eof,
                    line,
                };
            };

            let kind = match byte {
                b'\n' => {
                    source.bump();
                    TokenKind::Eol
                }
                b' ' | b'\t' | b'\r' | b',' => {
                    source.bump();
                    continue;
                }
                b'#' => {
                    source.bump();
                    let text = source.take_while(|byte| byte != b'\n');
                    TokenKind::Comment(text.trim().to_string())
                }
                b'"' => {
                    source.bump();
                    let text = source.take_while(|byte| byte != b'"');
                    if source.bump() == Some(b'"') {
                        TokenKind::String(text)
                    } else {
                        TokenKind::Illegal(format!("unterminated string \"{}", text))
                    }
                }
                b'0'..=b'9' | b'-' => {
                    let text = source.take_while(|byte| {
                        byte.is_ascii_digit() || byte == b'.' || byte == b'/' || byte == b'-'
                    });
                    match classify_numeric(&text) {
                        Numeric::Single(kind) => kind,
                        Numeric::Cidr(addr, mask) => {
                            self.pending.push_back(Token {
                                kind: TokenKind::IpAddress(mask),
                                line,
                            });
                            TokenKind::IpAddress(addr)
                        }
                    }
                }
                byte if byte.is_ascii_alphabetic() => {
                    let text = source.take_while(|byte| !byte.is_ascii_whitespace());
                    match text.as_str() {
                        "true" => TokenKind::Boolean(true),
                        "false" => TokenKind::Boolean(false),
                        _ => match Keyword::lookup(&text) {
                            Some(keyword) => TokenKind::Keyword(keyword),
                            None => TokenKind::String(text),
                        },
                    }
                }
                other => {
                    source.bump();
                    TokenKind::Illegal((other as char).to_string())
                }
            };

            return Token { kind, line };
        }
    }
}

enum Numeric {
    Single(TokenKind),
    Cidr(Ipv4Addr, Ipv4Addr),
}

fn classify_numeric(text: &str) -> Numeric {
    let illegal = || Numeric::Single(TokenKind::Illegal(text.to_string()));

    let dots = text.matches('.').count();
    let slashes = text.matches('/').count();
    let dashes = text.matches('-').count();

    if dashes > 1 || (dashes == 1 && !text.starts_with('-')) {
        return illegal();
    }

    match (dots, slashes) {
        (0, 0) => match text.parse::<i64>() {
            Ok(value) => Numeric::Single(TokenKind::Number(value)),
            Err(_) => illegal(),
        },
        (3, 0) if dashes == 0 => match text.parse::<Ipv4Addr>() {
            Ok(ip) => Numeric::Single(TokenKind::IpAddress(ip)),
            Err(_) => illegal(),
        },
        (3, 1) if dashes == 0 => {
            let Some((addr, prefix)) = text.split_once('/') else {
                return illegal();
            };
            let (Ok(addr), Ok(prefix)) = (addr.parse::<Ipv4Addr>(), prefix.parse::<u8>()) else {
                return illegal();
            };
            match Ipv4Net::new(addr, prefix) {
                Ok(net) => Numeric::Cidr(addr, net.netmask()),
                Err(_) => illegal(),
            }
        }
        _ => illegal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new("test", text);
        let mut kinds = Vec::new();
        loop {
            let token = lexer.next();
            let done = token.kind == TokenKind::Eof;
            kinds.push(token.kind);
            if done {
                break;
            }
        }
        kinds
    }

    struct TestGuard(String);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn test_keywords_and_literals() {
        assert_eq!(
            kinds("global\n  server-identifier 10.0.0.1\nend\n"),
            vec![
                TokenKind::Keyword(Keyword::Global),
                TokenKind::Eol,
                TokenKind::Keyword(Keyword::ServerIdentifier),
                TokenKind::IpAddress(Ipv4Addr::new(10, 0, 0, 1)),
                TokenKind::Eol,
                TokenKind::Keyword(Keyword::End),
                TokenKind::Eol,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_cidr_emits_address_and_mask() {
        assert_eq!(
            kinds("subnet 10.0.1.0/24"),
            vec![
                TokenKind::Keyword(Keyword::Subnet),
                TokenKind::IpAddress(Ipv4Addr::new(10, 0, 1, 0)),
                TokenKind::IpAddress(Ipv4Addr::new(255, 255, 255, 0)),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers_strings_booleans() {
        assert_eq!(
            kinds("option time-offset -3600 \"quoted value\" true false"),
            vec![
                TokenKind::Keyword(Keyword::Option),
                TokenKind::String("time-offset".to_string()),
                TokenKind::Number(-3600),
                TokenKind::String("quoted value".to_string()),
                TokenKind::Boolean(true),
                TokenKind::Boolean(false),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comma_separated_addresses() {
        assert_eq!(
            kinds("10.0.0.1, 10.0.0.2,10.0.0.3"),
            vec![
                TokenKind::IpAddress(Ipv4Addr::new(10, 0, 0, 1)),
                TokenKind::IpAddress(Ipv4Addr::new(10, 0, 0, 2)),
                TokenKind::IpAddress(Ipv4Addr::new(10, 0, 0, 3)),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comment_runs_to_end_of_line() {
        assert_eq!(
            kinds("# a comment, with commas\nend"),
            vec![
                TokenKind::Comment("a comment, with commas".to_string()),
                TokenKind::Eol,
                TokenKind::Keyword(Keyword::End),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_illegal_shapes() {
        for text in ["10.0.1", "10.0.0.1/33", "300.0.0.1", "1-2", "10.0.0.0/8/8"] {
            let first = kinds(text).remove(0);
            assert!(
                matches!(first, TokenKind::Illegal(_)),
                "{} lexed as {:?}",
                text,
                first
            );
        }
        assert!(matches!(kinds("\"open").remove(0), TokenKind::Illegal(_)));
        assert!(matches!(kinds("$").remove(0), TokenKind::Illegal(_)));
    }

    #[test]
    fn test_unread_replays_single_token() {
        let mut lexer = Lexer::new("test", "network pool");
        assert_eq!(lexer.next().kind, TokenKind::Keyword(Keyword::Network));
        lexer.unread();
        lexer.unread();
        assert_eq!(lexer.next().kind, TokenKind::Keyword(Keyword::Network));
        assert_eq!(lexer.next().kind, TokenKind::Keyword(Keyword::Pool));
        assert_eq!(lexer.next().kind, TokenKind::Eof);
    }

    #[test]
    fn test_line_numbers() {
        let mut lexer = Lexer::new("test", "global\n\nend\n");
        assert_eq!(lexer.next().line, 1);
        assert_eq!(lexer.next().line, 1);
        assert_eq!(lexer.next().line, 2);
        let end = lexer.next();
        assert_eq!(end.kind, TokenKind::Keyword(Keyword::End));
        assert_eq!(end.line, 3);
        assert_eq!(lexer.line(), 3);
    }

    #[test]
    fn test_rest_of_line_skips_comments() {
        let mut lexer = Lexer::new("test", "router 10.0.0.1 # gateway\nend");
        let tokens = lexer.rest_of_line();
        assert_eq!(tokens.len(), 2);
        assert_eq!(lexer.next().kind, TokenKind::Keyword(Keyword::End));
    }

    #[test]
    fn test_rest_of_line_leaves_eof() {
        let mut lexer = Lexer::new("test", "router 10.0.0.1");
        assert_eq!(lexer.rest_of_line().len(), 2);
        assert_eq!(lexer.next().kind, TokenKind::Eof);
    }

    #[test]
    fn test_include_stack() {
        let path = "test_lexer_include.conf".to_string();
        let _guard = TestGuard(path.clone());
        std::fs::write(&path, "network \"inner\"").unwrap();

        let mut lexer = Lexer::new("test", "global\nend");
        assert_eq!(lexer.next().kind, TokenKind::Keyword(Keyword::Global));
        lexer.push_reader(&path).unwrap();
        assert_eq!(lexer.source_name(), path);
        assert_eq!(lexer.next().kind, TokenKind::Keyword(Keyword::Network));
        assert_eq!(lexer.next().kind, TokenKind::String("inner".to_string()));
        assert_eq!(lexer.next().kind, TokenKind::Eol);
        assert_eq!(lexer.source_name(), "test");
        assert_eq!(lexer.next().kind, TokenKind::Eol);
        assert_eq!(lexer.next().kind, TokenKind::Keyword(Keyword::End));
    }

    #[test]
    fn test_missing_include_is_error() {
        let mut lexer = Lexer::new("test", "");
        assert!(lexer.push_reader("does-not-exist.conf").is_err());
        assert!(!lexer.pop_reader());
    }

    #[test]
    fn test_setting_keywords() {
        assert!(Keyword::Option.is_setting());
        assert!(Keyword::FreeLeaseAfter.is_setting());
        assert!(!Keyword::Range.is_setting());
        assert_eq!(Keyword::lookup("max-lease-time"), Some(Keyword::MaxLeaseTime));
        assert_eq!(Keyword::IgnoreRegistration.as_str(), "ignore-registration");
    }
}
