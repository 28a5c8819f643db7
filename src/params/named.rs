//! Named placeholder rewriting.
//!
//! A template is tokenized once with the `sqlparser` tokenizer for the
//! backend's dialect. A `:` token immediately followed by an unquoted word is
//! a placeholder; everything else (string literals of every flavour, quoted
//! identifiers, comments, dollar-quoted bodies, `::` casts) is copied through
//! byte for byte. Each distinct name gets the next position in order of first
//! appearance; repeated names share a position.

use std::iter::Peekable;
use std::str::CharIndices;

use serde_json::Value;
use sqlparser::dialect::{PostgreSqlDialect, SQLiteDialect};
use sqlparser::tokenizer::{Location, Token, TokenWithSpan, Tokenizer, TokenizerError, Word};

use super::error::{BindError, BindResult};
use super::map::Params;
use crate::source::Dialect;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    /// 1-based position into `NamedQuery::names`.
    Param(usize),
}

/// A SQL template with `:name` placeholders, parsed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedQuery {
    template: String,
    dialect: Dialect,
    segments: Vec<Segment>,
    names: Vec<String>,
    invalid: Option<BindError>,
}

/// A positional statement ready for the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    pub args: Vec<Value>,
}

impl NamedQuery {
    /// Parse a template for `dialect`.
    ///
    /// A template the tokenizer rejects (an unterminated literal, say) still
    /// parses, but every `bind` of it fails with [`BindError::Template`].
    pub fn parse(template: impl Into<String>, dialect: Dialect) -> Self {
        let template = template.into();
        let mut names: Vec<String> = Vec::new();
        let mut segments = Vec::new();

        let invalid = match split(&template, dialect) {
            Ok(pieces) => {
                for piece in pieces {
                    match piece {
                        Piece::Text(text) => segments.push(Segment::Text(text.to_string())),
                        Piece::Name(name) => {
                            let position = match names.iter().position(|n| n == name) {
                                Some(index) => index + 1,
                                None => {
                                    names.push(name.to_string());
                                    names.len()
                                }
                            };
                            segments.push(Segment::Param(position));
                        }
                    }
                }
                None
            }
            Err(err) => Some(BindError::from(err)),
        };

        Self {
            template,
            dialect,
            segments,
            names,
            invalid,
        }
    }

    /// The original template text.
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Distinct placeholder names in positional order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Check if the template has any placeholders.
    pub fn has_placeholders(&self) -> bool {
        !self.names.is_empty()
    }

    /// Rewrite into positional form and collect the argument values.
    ///
    /// Keys in `params` that the template does not mention are ignored.
    pub fn bind(&self, params: Option<&Params>) -> BindResult<BoundQuery> {
        if let Some(err) = &self.invalid {
            return Err(err.clone());
        }
        if self.names.is_empty() {
            return Ok(BoundQuery {
                sql: self.template.clone(),
                args: Vec::new(),
            });
        }

        let params = params.ok_or_else(|| BindError::NoParameters {
            names: self.names.clone(),
        })?;

        let args = self
            .names
            .iter()
            .map(|name| {
                params
                    .get(name)
                    .cloned()
                    .ok_or_else(|| BindError::MissingParameter { name: name.clone() })
            })
            .collect::<BindResult<Vec<_>>>()?;

        let mut sql = String::with_capacity(self.template.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => sql.push_str(text),
                Segment::Param(position) => sql.push_str(&self.dialect.placeholder(*position)),
            }
        }

        Ok(BoundQuery { sql, args })
    }
}

enum Piece<'a> {
    Text(&'a str),
    Name(&'a str),
}

fn tokenize(template: &str, dialect: Dialect) -> Result<Vec<TokenWithSpan>, TokenizerError> {
    match dialect {
        Dialect::Postgres => Tokenizer::new(&PostgreSqlDialect {}, template).tokenize_with_location(),
        Dialect::Sqlite => Tokenizer::new(&SQLiteDialect {}, template).tokenize_with_location(),
    }
}

fn split(template: &str, dialect: Dialect) -> Result<Vec<Piece<'_>>, TokenizerError> {
    let tokens = tokenize(template, dialect)?;
    let mut offsets = Offsets::new(template);
    let mut pieces = Vec::new();
    let mut literal_start = 0;

    for pair in tokens.windows(2) {
        let [colon, word] = pair else {
            continue;
        };
        let (Token::Colon, Token::Word(Word { quote_style: None, .. })) = (&colon.token, &word.token)
        else {
            continue;
        };

        let start = offsets.at(colon.span.start);
        let end = offsets.at(word.span.end);
        if literal_start < start {
            pieces.push(Piece::Text(&template[literal_start..start]));
        }
        pieces.push(Piece::Name(&template[start + 1..end]));
        literal_start = end;
    }

    if literal_start < template.len() {
        pieces.push(Piece::Text(&template[literal_start..]));
    }
    Ok(pieces)
}

/// Turns tokenizer locations (1-based line, column counted in chars) into
/// byte offsets. Locations must be asked for in increasing order.
struct Offsets<'a> {
    chars: Peekable<CharIndices<'a>>,
    len: usize,
    line: u64,
    column: u64,
}

impl<'a> Offsets<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.char_indices().peekable(),
            len: text.len(),
            line: 1,
            column: 1,
        }
    }

    fn at(&mut self, location: Location) -> usize {
        while (self.line, self.column) < (location.line, location.column) {
            match self.chars.next() {
                Some((_, '\n')) => {
                    self.line += 1;
                    self.column = 1;
                }
                Some(_) => self.column += 1,
                None => return self.len,
            }
        }
        self.chars.peek().map_or(self.len, |(offset, _)| *offset)
    }
}
