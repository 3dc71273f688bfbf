//! Stack-based evaluator for postfix (reverse-Polish) expressions.
//!
//! Expressions are whitespace-separated tokens: numeric literals push onto
//! the stack, operators pop their arguments and push the result. Binary
//! operators take their left argument deeper in the stack, so `3 10 -`
//! evaluates to `3 - 10 = -7`.
//!
//! Supported operators: `+ - * / %` (`mod` is an alias for `%`), `floor`
//! `ceil` `round` `roundn` `abs` `chs` `eq` `lt` `gt` `not` `inf` `cos`
//! `sin`. Comparisons push `1.0` for true and `0.0` for false; `cos` and
//! `sin` take degrees; `roundn` pops the decimal count first, then the
//! value.

use thiserror::Error;

/// Errors raised while evaluating a postfix expression.
///
/// Every variant aborts the single evaluation that raised it; callers keep
/// their previous value and log.
#[derive(Debug, Error, PartialEq)]
pub enum RpnError {
    /// An operator needed more arguments than the stack held.
    #[error("stack underflow at token '{token}' (position {position})")]
    StackUnderflow { token: String, position: usize },

    /// `/` or `%` with a zero divisor.
    #[error("division by zero at token '{token}'")]
    DivisionByZero { token: String },

    /// A token that is neither a numeric literal nor a known operator.
    #[error("unknown token '{token}'")]
    UnknownToken { token: String },

    /// The expression contained no tokens at all.
    #[error("empty expression")]
    EmptyExpression,
}

/// Evaluates a whitespace-separated postfix expression to a single number.
///
/// Leftover stack entries below the result are ignored, matching the loose
/// conventions of the dataref formulas this engine exists for (`"1 2 3"`
/// evaluates to `3.0`).
///
/// # Errors
///
/// Returns [`RpnError`] on stack underflow, division by zero, or an
/// unrecognized token. The whole expression is abandoned at the first error.
///
/// # Examples
///
/// ```rust
/// use xplink_core::formula::rpn::evaluate;
///
/// assert_eq!(evaluate("3 10 - abs").unwrap(), 7.0);
/// assert_eq!(evaluate("20 2 - 0.5 *").unwrap(), 9.0);
/// ```
pub fn evaluate(expression: &str) -> Result<f64, RpnError> {
    let mut stack: Vec<f64> = Vec::new();

    let mut tokens = expression.split_whitespace().enumerate().peekable();
    if tokens.peek().is_none() {
        return Err(RpnError::EmptyExpression);
    }

    for (position, token) in tokens {
        if let Ok(number) = token.parse::<f64>() {
            stack.push(number);
            continue;
        }
        apply_operator(&mut stack, token, position)?;
    }

    stack.pop().ok_or(RpnError::EmptyExpression)
}

fn apply_operator(stack: &mut Vec<f64>, token: &str, position: usize) -> Result<(), RpnError> {
    let underflow = || RpnError::StackUnderflow {
        token: token.to_string(),
        position,
    };

    match token {
        "+" => {
            let (a, b) = pop_pair(stack).ok_or_else(underflow)?;
            stack.push(a + b);
        }
        "-" => {
            let (a, b) = pop_pair(stack).ok_or_else(underflow)?;
            stack.push(a - b);
        }
        "*" => {
            let (a, b) = pop_pair(stack).ok_or_else(underflow)?;
            stack.push(a * b);
        }
        "/" => {
            let (a, b) = pop_pair(stack).ok_or_else(underflow)?;
            if b == 0.0 {
                return Err(RpnError::DivisionByZero {
                    token: token.to_string(),
                });
            }
            stack.push(a / b);
        }
        "%" | "mod" => {
            let (a, b) = pop_pair(stack).ok_or_else(underflow)?;
            if b == 0.0 {
                return Err(RpnError::DivisionByZero {
                    token: token.to_string(),
                });
            }
            stack.push(a % b);
        }
        "floor" => {
            let a = stack.pop().ok_or_else(underflow)?;
            stack.push(a.floor());
        }
        "ceil" => {
            let a = stack.pop().ok_or_else(underflow)?;
            stack.push(a.ceil());
        }
        "round" => {
            let a = stack.pop().ok_or_else(underflow)?;
            stack.push(a.round());
        }
        "roundn" => {
            // Decimal count is the top of the stack, the value below it.
            let decimals = stack.pop().ok_or_else(underflow)?;
            let value = stack.pop().ok_or_else(underflow)?;
            let factor = 10f64.powi(decimals as i32);
            stack.push((value * factor).round() / factor);
        }
        "abs" => {
            let a = stack.pop().ok_or_else(underflow)?;
            stack.push(a.abs());
        }
        "chs" => {
            let a = stack.pop().ok_or_else(underflow)?;
            stack.push(-a);
        }
        "eq" => {
            let (a, b) = pop_pair(stack).ok_or_else(underflow)?;
            stack.push(bool_value(a == b));
        }
        "lt" => {
            let (a, b) = pop_pair(stack).ok_or_else(underflow)?;
            stack.push(bool_value(a < b));
        }
        "gt" => {
            let (a, b) = pop_pair(stack).ok_or_else(underflow)?;
            stack.push(bool_value(a > b));
        }
        "not" => {
            let a = stack.pop().ok_or_else(underflow)?;
            stack.push(bool_value(a == 0.0));
        }
        "inf" => stack.push(f64::INFINITY),
        "cos" => {
            let a = stack.pop().ok_or_else(underflow)?;
            stack.push(a.to_radians().cos());
        }
        "sin" => {
            let a = stack.pop().ok_or_else(underflow)?;
            stack.push(a.to_radians().sin());
        }
        _ => {
            return Err(RpnError::UnknownToken {
                token: token.to_string(),
            })
        }
    }
    Ok(())
}

/// Pops `(left, right)` for a binary operator: the right argument is the
/// top of the stack.
fn pop_pair(stack: &mut Vec<f64>) -> Option<(f64, f64)> {
    let b = stack.pop()?;
    let a = stack.pop()?;
    Some((a, b))
}

fn bool_value(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
