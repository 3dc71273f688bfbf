//! Expression text classification and `${...}` token substitution.
//!
//! A formula's text is parsed exactly once into an [`Expression`]; after
//! that, recomputation only substitutes current values and hands the result
//! to the RPN engine. No string re-inspection happens per update.
//!
//! Token names inside `${...}` are classified into a [`TokenKind`] by
//! prefix, checked in a fixed order: `data:` (internal), `state:`
//! (activation layer), icon fonts (`fa:`, `wi:` — glyphs, not values), then
//! the dataref path heuristic. Whatever remains is opaque text that gets the
//! default substitution.

use std::fmt;

use tracing::warn;

use crate::domain::variable::{VariableKind, INTERNAL_PREFIX, STATE_PREFIX};

/// Icon-glyph name prefixes. `${fa:plane}` names a Font Awesome glyph for
/// the rendering layer, not a value; such tokens never become dependencies
/// and are passed through substitution untouched.
pub const ICON_FONT_PREFIXES: [&str; 2] = ["fa:", "wi:"];

/// Substituted for a token whose value is not available yet.
pub const DEFAULT_SUBSTITUTION: &str = "0.0";

// ── Tokens ────────────────────────────────────────────────────────────────────

/// What a `${...}` token refers to, decided once at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// `data:` process-local variable.
    Internal,
    /// `state:` value owned by the activation layer, fetched through a
    /// provider at substitution time.
    State,
    /// A simulator dataref path.
    Remote,
    /// An icon-font glyph name; not a value.
    Icon,
    /// Neither prefixed nor plausible as a dataref path; substituted with
    /// the default and never subscribed.
    Opaque,
}

impl TokenKind {
    /// Classifies a captured token name. Prefixes are checked in a fixed
    /// order; the trailing heuristic accepts dataref-shaped paths only
    /// (contains `/`, longer than 7 bytes — short slashed strings like
    /// `ON/R` are annunciator text, not paths).
    pub fn classify(name: &str) -> TokenKind {
        if name.starts_with(INTERNAL_PREFIX) {
            TokenKind::Internal
        } else if name.starts_with(STATE_PREFIX) {
            TokenKind::State
        } else if ICON_FONT_PREFIXES.iter().any(|p| name.starts_with(p)) {
            TokenKind::Icon
        } else if looks_like_dataref_path(name) {
            TokenKind::Remote
        } else {
            TokenKind::Opaque
        }
    }
}

/// One `${...}` occurrence in an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRef {
    /// The full substring including delimiters, e.g. `${sim/foo/bar}`.
    pub token: String,
    /// The captured name, e.g. `sim/foo/bar`.
    pub name: String,
    pub kind: TokenKind,
}

impl TokenRef {
    fn new(token: &str, name: &str) -> TokenRef {
        TokenRef {
            token: token.to_string(),
            name: name.to_string(),
            kind: TokenKind::classify(name),
        }
    }
}

fn looks_like_dataref_path(name: &str) -> bool {
    name.contains('/') && name.len() > 7
}

// ── Expressions ───────────────────────────────────────────────────────────────

/// A formula's text, parsed once at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// A numeric literal; evaluates to itself.
    Constant(f64),
    /// A bare reference to exactly one variable, no `${}` delimiters;
    /// evaluates to that variable's raw value.
    Reference { name: String, kind: VariableKind },
    /// Free text mixing `${...}` tokens with postfix operators, e.g.
    /// `${a} ${b} - abs`. An empty token list means pure RPN text.
    Template { text: String, tokens: Vec<TokenRef> },
}

impl Expression {
    /// Parses expression text into its evaluated-once classification.
    ///
    /// Any text containing `${...}` tokens is a [`Expression::Template`].
    /// Token-free text is, in order: a numeric constant, a prefixed
    /// internal/state reference, a dataref-shaped remote reference, or
    /// fallback RPN-only template text.
    ///
    /// # Examples
    ///
    /// ```
    /// use xplink_core::formula::template::Expression;
    ///
    /// assert_eq!(Expression::parse("3.5"), Expression::Constant(3.5));
    /// assert!(matches!(
    ///     Expression::parse("sim/cockpit/radio/com1"),
    ///     Expression::Reference { .. }
    /// ));
    /// assert!(matches!(
    ///     Expression::parse("${sim/foo/bar} 100 *"),
    ///     Expression::Template { .. }
    /// ));
    /// ```
    pub fn parse(text: &str) -> Expression {
        let trimmed = text.trim();
        let tokens = scan_tokens(trimmed);
        if !tokens.is_empty() {
            return Expression::Template {
                text: trimmed.to_string(),
                tokens,
            };
        }
        if let Ok(number) = trimmed.parse::<f64>() {
            return Expression::Constant(number);
        }
        if trimmed.starts_with(INTERNAL_PREFIX) || trimmed.starts_with(STATE_PREFIX) {
            return Expression::Reference {
                name: trimmed.to_string(),
                kind: VariableKind::of(trimmed),
            };
        }
        if looks_like_dataref_path(trimmed) {
            return Expression::Reference {
                name: trimmed.to_string(),
                kind: VariableKind::Remote,
            };
        }
        Expression::Template {
            text: trimmed.to_string(),
            tokens: Vec::new(),
        }
    }

    /// Names this expression depends on through the variable registry:
    /// internal and remote references. State names are fetched through a
    /// provider instead and icon/opaque tokens are not values.
    pub fn dependency_names(&self) -> Vec<&str> {
        match self {
            Expression::Constant(_) => Vec::new(),
            Expression::Reference { name, kind } => match kind {
                VariableKind::Internal | VariableKind::Remote => vec![name.as_str()],
                VariableKind::State => Vec::new(),
            },
            Expression::Template { tokens, .. } => tokens
                .iter()
                .filter(|t| matches!(t.kind, TokenKind::Internal | TokenKind::Remote))
                .map(|t| t.name.as_str())
                .collect(),
        }
    }

    /// `state:` names referenced by this expression.
    pub fn state_names(&self) -> Vec<&str> {
        match self {
            Expression::Constant(_) => Vec::new(),
            Expression::Reference { name, kind } => match kind {
                VariableKind::State => vec![name.as_str()],
                _ => Vec::new(),
            },
            Expression::Template { tokens, .. } => tokens
                .iter()
                .filter(|t| t.kind == TokenKind::State)
                .map(|t| t.name.as_str())
                .collect(),
        }
    }

    /// Replaces every value token with the string `resolve` returns for it,
    /// or [`DEFAULT_SUBSTITUTION`] (warned) when `resolve` has nothing.
    /// Icon tokens are left in place for the rendering layer.
    ///
    /// Only meaningful for [`Expression::Template`]; the other variants
    /// return their text form unchanged.
    pub fn substitute(&self, mut resolve: impl FnMut(&TokenRef) -> Option<String>) -> String {
        let (text, tokens) = match self {
            Expression::Constant(value) => return value.to_string(),
            Expression::Reference { name, .. } => return name.clone(),
            Expression::Template { text, tokens } => (text, tokens),
        };
        let mut result = text.clone();
        for token in tokens {
            if token.kind == TokenKind::Icon {
                continue;
            }
            let value = match resolve(token) {
                Some(value) => value,
                None => {
                    warn!(
                        "no value for {} in '{text}'; substituting {DEFAULT_SUBSTITUTION}",
                        token.name
                    );
                    DEFAULT_SUBSTITUTION.to_string()
                }
            };
            result = result.replace(&token.token, &value);
        }
        result
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Constant(value) => write!(f, "{value}"),
            Expression::Reference { name, .. } => write!(f, "{name}"),
            Expression::Template { text, .. } => write!(f, "{text}"),
        }
    }
}

/// Finds every `${...}` occurrence, first occurrence wins for duplicates.
/// An unterminated `${` ends the scan with a warning.
fn scan_tokens(text: &str) -> Vec<TokenRef> {
    let mut tokens: Vec<TokenRef> = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                let token = &rest[start..start + 2 + end + 1];
                if !tokens.iter().any(|t| t.token == token) {
                    tokens.push(TokenRef::new(token, name));
                }
                rest = &after[end + 1..];
            }
            None => {
                warn!("unterminated token in '{text}'");
                break;
            }
        }
    }
    tokens
}

// ── Tests ─────────────────────────────────────────────────────────────────────
