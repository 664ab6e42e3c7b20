//! Condition expression language.
//!
//! ```text
//! expression     := boolean-term (OR expression)?
//! boolean-term   := boolean-factor (AND boolean-term)?
//! boolean-factor := NOT boolean-factor | term
//! term           := '(' expression ')' | value (comparator value)?
//! value          := identifier | number | "literal" | v1.2.3.4
//! ```
//!
//! Keywords are case-insensitive. `><`, `<<` and `>>` mean contains,
//! starts-with and ends-with on strings, and bitwise-and, high-word-equals
//! and low-word-equals on numbers and versions. A leading `~` makes any
//! comparator compare strings case-insensitively. Values of different kinds
//! are coerced when possible; when coercion fails only `<>` is true.

use thiserror::Error;
use tracing::debug;

use crate::variables::{VariableError, VariableLookup};
use crate::variant::{parse_version_string, Variant};

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("bad condition syntax at position {position}: {message}")]
    Syntax { position: usize, message: String },
    #[error("failed to read variable '{name}' while evaluating condition")]
    Variable {
        name: String,
        #[source]
        source: VariableError,
    },
}

impl ConditionError {
    /// True when the condition text itself is malformed, as opposed to an
    /// infrastructure failure while resolving a variable.
    pub fn is_syntax(&self) -> bool {
        matches!(self, Self::Syntax { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
    Equal,
    NotEqual,
    /// `><`
    Contains,
    /// `<<`
    StartsWith,
    /// `>>`
    EndsWith,
}

#[derive(Debug, Clone, PartialEq)]
enum SymbolKind {
    End,
    Or,
    And,
    Not,
    /// The flag is set for `~` comparators.
    Comparison(Comparison, bool),
    LeftParen,
    RightParen,
    Number,
    Identifier,
    Literal,
    Version,
}

#[derive(Debug, Clone)]
struct Symbol {
    kind: SymbolKind,
    position: usize,
    value: Variant,
}

pub fn evaluate(lookup: &dyn VariableLookup, condition: &str) -> Result<bool, ConditionError> {
    let mut parser = Parser::new(lookup, condition)?;
    let result = parser.expression()?;
    if parser.symbol.kind != SymbolKind::End {
        return Err(parser.syntax_error("expected end of condition"));
    }
    debug!(condition, result, "evaluated condition");
    Ok(result)
}

struct Parser<'a> {
    lookup: &'a dyn VariableLookup,
    input: &'a str,
    offset: usize,
    symbol: Symbol,
}

impl<'a> Parser<'a> {
    fn new(lookup: &'a dyn VariableLookup, input: &'a str) -> Result<Self, ConditionError> {
        let mut parser = Self {
            lookup,
            input,
            offset: 0,
            symbol: Symbol {
                kind: SymbolKind::End,
                position: 0,
                value: Variant::None,
            },
        };
        parser.advance()?;
        if parser.symbol.kind == SymbolKind::End {
            return Err(parser.syntax_error("condition is empty"));
        }
        Ok(parser)
    }

    fn syntax_error(&self, message: &str) -> ConditionError {
        ConditionError::Syntax {
            position: self.symbol.position,
            message: message.to_string(),
        }
    }

    fn expression(&mut self) -> Result<bool, ConditionError> {
        let left = self.boolean_term()?;
        if self.symbol.kind != SymbolKind::Or {
            return Ok(left);
        }
        self.advance()?;
        let right = self.expression()?;
        Ok(left || right)
    }

    fn boolean_term(&mut self) -> Result<bool, ConditionError> {
        let left = self.boolean_factor()?;
        if self.symbol.kind != SymbolKind::And {
            return Ok(left);
        }
        self.advance()?;
        let right = self.boolean_term()?;
        Ok(left && right)
    }

    fn boolean_factor(&mut self) -> Result<bool, ConditionError> {
        if self.symbol.kind == SymbolKind::Not {
            self.advance()?;
            return Ok(!self.boolean_factor()?);
        }
        self.term()
    }

    fn term(&mut self) -> Result<bool, ConditionError> {
        if self.symbol.kind == SymbolKind::LeftParen {
            self.advance()?;
            let result = self.expression()?;
            if self.symbol.kind != SymbolKind::RightParen {
                return Err(self.syntax_error("expected ')'"));
            }
            self.advance()?;
            return Ok(result);
        }

        let left = self.value()?;
        let SymbolKind::Comparison(comparison, ignore_case) = self.symbol.kind else {
            return Ok(left.as_bool());
        };
        self.advance()?;
        let right = self.value()?;
        if ignore_case {
            return Ok(compare_values(
                &fold_case(left),
                comparison,
                &fold_case(right),
            ));
        }
        Ok(compare_values(&left, comparison, &right))
    }

    fn value(&mut self) -> Result<Variant, ConditionError> {
        let value = match self.symbol.kind {
            SymbolKind::Identifier => {
                let name = self.symbol.value.to_string_value();
                self.lookup
                    .lookup(&name)
                    .map_err(|source| ConditionError::Variable {
                        name: name.clone(),
                        source,
                    })?
                    .unwrap_or(Variant::None)
            }
            SymbolKind::Number | SymbolKind::Literal | SymbolKind::Version => {
                self.symbol.value.clone()
            }
            _ => return Err(self.syntax_error("expected a value")),
        };
        self.advance()?;
        Ok(value)
    }

    fn advance(&mut self) -> Result<(), ConditionError> {
        self.symbol = self.next_symbol()?;
        Ok(())
    }

    fn next_symbol(&mut self) -> Result<Symbol, ConditionError> {
        let input = self.input;
        let bytes = input.as_bytes();
        while self.offset < bytes.len() && bytes[self.offset].is_ascii_whitespace() {
            self.offset += 1;
        }

        let start = self.offset;
        let symbol = |kind: SymbolKind, value: Variant| Symbol {
            kind,
            position: start,
            value,
        };
        let error = |message: &str| ConditionError::Syntax {
            position: start,
            message: message.to_string(),
        };

        let Some(&current) = bytes.get(start) else {
            return Ok(symbol(SymbolKind::End, Variant::None));
        };
        let next = bytes.get(start + 1).copied();

        // Two-character comparators before their one-character prefixes.
        let two_char = match (current, next) {
            (b'<', Some(b'=')) => Some(Comparison::LessOrEqual),
            (b'<', Some(b'>')) => Some(Comparison::NotEqual),
            (b'<', Some(b'<')) => Some(Comparison::StartsWith),
            (b'>', Some(b'=')) => Some(Comparison::GreaterOrEqual),
            (b'>', Some(b'<')) => Some(Comparison::Contains),
            (b'>', Some(b'>')) => Some(Comparison::EndsWith),
            _ => None,
        };
        if let Some(comparison) = two_char {
            self.offset += 2;
            return Ok(symbol(SymbolKind::Comparison(comparison, false), Variant::None));
        }

        match current {
            b'~' => {
                if !matches!(next, Some(b'<' | b'>' | b'=')) {
                    return Err(error("expected a comparator after '~'"));
                }
                self.offset += 1;
                let comparator = self.next_symbol()?;
                let SymbolKind::Comparison(comparison, _) = comparator.kind else {
                    return Err(error("expected a comparator after '~'"));
                };
                Ok(symbol(SymbolKind::Comparison(comparison, true), Variant::None))
            }
            b'<' => {
                self.offset += 1;
                Ok(symbol(
                    SymbolKind::Comparison(Comparison::Less, false),
                    Variant::None,
                ))
            }
            b'>' => {
                self.offset += 1;
                Ok(symbol(
                    SymbolKind::Comparison(Comparison::Greater, false),
                    Variant::None,
                ))
            }
            b'=' => {
                self.offset += 1;
                Ok(symbol(
                    SymbolKind::Comparison(Comparison::Equal, false),
                    Variant::None,
                ))
            }
            b'(' => {
                self.offset += 1;
                Ok(symbol(SymbolKind::LeftParen, Variant::None))
            }
            b')' => {
                self.offset += 1;
                Ok(symbol(SymbolKind::RightParen, Variant::None))
            }
            b'"' => {
                let literal = self.scan_literal().ok_or_else(|| error("unterminated literal"))?;
                Ok(symbol(SymbolKind::Literal, Variant::String(literal)))
            }
            b'v' | b'V' if next.is_some_and(|b| b.is_ascii_digit()) => {
                self.offset += 1;
                let digits_start = self.offset;
                while self.offset < bytes.len()
                    && (bytes[self.offset].is_ascii_digit() || bytes[self.offset] == b'.')
                {
                    self.offset += 1;
                }
                let version = parse_version_string(&input[digits_start..self.offset])
                    .ok_or_else(|| error("invalid version literal"))?;
                Ok(symbol(SymbolKind::Version, Variant::Version(version)))
            }
            b'-' | b'0'..=b'9' if current != b'-' || next.is_some_and(|b| b.is_ascii_digit()) => {
                self.offset += 1;
                while self.offset < bytes.len() && bytes[self.offset].is_ascii_digit() {
                    self.offset += 1;
                }
                if self.offset < bytes.len()
                    && (bytes[self.offset].is_ascii_alphabetic() || bytes[self.offset] == b'_')
                {
                    return Err(error("identifiers must not start with a digit"));
                }
                let number = input[start..self.offset]
                    .parse::<i64>()
                    .map_err(|_| error("number out of range"))?;
                Ok(symbol(SymbolKind::Number, Variant::Numeric(number)))
            }
            b'_' | b'a'..=b'z' | b'A'..=b'Z' => {
                while self.offset < bytes.len()
                    && (bytes[self.offset].is_ascii_alphanumeric() || bytes[self.offset] == b'_')
                {
                    self.offset += 1;
                }
                let word = &input[start..self.offset];
                let kind = if word.eq_ignore_ascii_case("OR") {
                    SymbolKind::Or
                } else if word.eq_ignore_ascii_case("AND") {
                    SymbolKind::And
                } else if word.eq_ignore_ascii_case("NOT") {
                    SymbolKind::Not
                } else {
                    SymbolKind::Identifier
                };
                Ok(symbol(kind, Variant::string(word)))
            }
            _ => Err(error("unexpected character")),
        }
    }

    /// Scans a quoted literal starting at the opening quote. A doubled quote
    /// inside the literal stands for one quote character.
    fn scan_literal(&mut self) -> Option<String> {
        let input = self.input;
        let bytes = input.as_bytes();
        let mut literal = String::new();
        let mut segment_start = self.offset + 1;
        let mut index = segment_start;
        while index < bytes.len() {
            if bytes[index] == b'"' {
                literal.push_str(&input[segment_start..index]);
                if bytes.get(index + 1) == Some(&b'"') {
                    literal.push('"');
                    index += 2;
                    segment_start = index;
                    continue;
                }
                self.offset = index + 1;
                return Some(literal);
            }
            index += 1;
        }
        None
    }
}

/// Only strings change; numbers and versions compare the same either way.
fn fold_case(value: Variant) -> Variant {
    match value {
        Variant::String(value) => Variant::String(value.to_lowercase()),
        value => value,
    }
}

pub fn compare_values(left: &Variant, comparison: Comparison, right: &Variant) -> bool {
    let incomparable = comparison == Comparison::NotEqual;
    match (left, right) {
        (Variant::String(l), Variant::String(r)) => compare_strings(l, comparison, r),
        (Variant::Numeric(l), Variant::Numeric(r)) => compare_integers(*l, comparison, *r),
        (Variant::Version(l), Variant::Version(r)) => compare_versions(*l, comparison, *r),
        (Variant::None, Variant::None) => matches!(
            comparison,
            Comparison::Equal | Comparison::LessOrEqual | Comparison::GreaterOrEqual
        ),
        (Variant::None, _) | (_, Variant::None) => incomparable,
        (Variant::String(s), Variant::Numeric(n)) => match s.trim().parse::<i64>() {
            Ok(parsed) => compare_integers(parsed, comparison, *n),
            Err(_) => incomparable,
        },
        (Variant::Numeric(n), Variant::String(s)) => match s.trim().parse::<i64>() {
            Ok(parsed) => compare_integers(*n, comparison, parsed),
            Err(_) => incomparable,
        },
        (Variant::String(s), Variant::Version(v)) => match parse_version_string(s) {
            Some(parsed) => compare_versions(parsed, comparison, *v),
            None => incomparable,
        },
        (Variant::Version(v), Variant::String(s)) => match parse_version_string(s) {
            Some(parsed) => compare_versions(*v, comparison, parsed),
            None => incomparable,
        },
        (Variant::Numeric(n), Variant::Version(v)) => match u64::try_from(*n) {
            Ok(parsed) => compare_versions(parsed, comparison, *v),
            Err(_) => incomparable,
        },
        (Variant::Version(v), Variant::Numeric(n)) => match u64::try_from(*n) {
            Ok(parsed) => compare_versions(*v, comparison, parsed),
            Err(_) => incomparable,
        },
    }
}

fn compare_strings(left: &str, comparison: Comparison, right: &str) -> bool {
    match comparison {
        Comparison::Less => left < right,
        Comparison::Greater => left > right,
        Comparison::LessOrEqual => left <= right,
        Comparison::GreaterOrEqual => left >= right,
        Comparison::Equal => left == right,
        Comparison::NotEqual => left != right,
        Comparison::Contains => left.contains(right),
        Comparison::StartsWith => left.starts_with(right),
        Comparison::EndsWith => left.ends_with(right),
    }
}

fn compare_integers(left: i64, comparison: Comparison, right: i64) -> bool {
    match comparison {
        Comparison::Less => left < right,
        Comparison::Greater => left > right,
        Comparison::LessOrEqual => left <= right,
        Comparison::GreaterOrEqual => left >= right,
        Comparison::Equal => left == right,
        Comparison::NotEqual => left != right,
        Comparison::Contains => left & right != 0,
        Comparison::StartsWith => (left >> 16) & 0xFFFF == right,
        Comparison::EndsWith => left & 0xFFFF == right,
    }
}

fn compare_versions(left: u64, comparison: Comparison, right: u64) -> bool {
    match comparison {
        Comparison::Less => left < right,
        Comparison::Greater => left > right,
        Comparison::LessOrEqual => left <= right,
        Comparison::GreaterOrEqual => left >= right,
        Comparison::Equal => left == right,
        Comparison::NotEqual => left != right,
        Comparison::Contains => left & right != 0,
        Comparison::StartsWith => (left >> 16) & 0xFFFF == right,
        Comparison::EndsWith => left & 0xFFFF == right,
    }
}
