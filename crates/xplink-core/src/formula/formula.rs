//! The [`Formula`] cell: a variable whose value is computed from others.
//!
//! A formula parses its expression text once, registers itself as a listener
//! on every internal/remote dependency, and on any of their changes
//! substitutes current values into the text, evaluates the result, and
//! republishes through its own output variable. Consumers listen on that
//! output cell exactly as on any other variable, so formulas cascade.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::variable::{
    DataType, RegistryError, Value, Variable, VariableKind, VariableListener, VariableRegistry,
    INTERNAL_PREFIX, STATE_PREFIX,
};
use crate::formula::rpn::{self, RpnError};
use crate::formula::template::{Expression, TokenKind, TokenRef};

/// Namespace UUID for deterministic formula identifiers: the same owner and
/// expression text always produce the same formula id.
const FORMULA_NAMESPACE: Uuid = Uuid::from_u128(0x1b0b_7f3a_55c4_4e0b_9a63_d1df_6f0a_42c7);

/// Supplies `state:` values owned by the activation layer.
///
/// State values never live in the [`VariableRegistry`]; a formula fetches
/// them through this trait at substitution time. Names arrive with the
/// `state:` prefix already stripped.
#[cfg_attr(test, mockall::automock)]
pub trait StateProvider: Send + Sync {
    /// Current value of `name` in string form, or `None` when the
    /// activation layer has nothing for it.
    fn state_value(&self, name: &str) -> Option<String>;
}

/// Errors raised while constructing a [`Formula`].
#[derive(Debug, Error)]
pub enum FormulaError {
    /// The expression text was empty or whitespace.
    #[error("formula for {owner} has no expression text")]
    EmptyExpression { owner: String },

    /// A dependency or the output cell could not be registered.
    #[error("formula registration failed")]
    Registry(#[from] RegistryError),
}

// ── Formula ───────────────────────────────────────────────────────────────────

/// A derived variable.
///
/// Constructed with [`Formula::new`], which parses the text, registers the
/// output cell and all dependencies, subscribes to them, and computes the
/// initial value. Dropping the last `Arc` detaches it implicitly (listeners
/// are held weakly); [`Formula::detach`] does so eagerly.
pub struct Formula {
    id: Uuid,
    owner: String,
    expression: Expression,
    cell: Arc<Variable>,
    dependencies: HashMap<String, Arc<Variable>>,
    format: Option<String>,
    state_provider: Option<Arc<dyn StateProvider>>,
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Formula")
            .field("owner", &self.owner)
            .field("id", &self.id)
            .field("expression", &self.expression)
            .field("value", &self.cell.value())
            .finish()
    }
}

impl Formula {
    /// Parses `expression_text` and wires the formula into the registry.
    ///
    /// `owner` is a display name for logs and identity (typically the deck
    /// widget the formula renders for). Internal and remote dependencies are
    /// created in `registry` on demand; `state:` names are resolved through
    /// `state_provider` instead. The initial value is computed before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns [`FormulaError::EmptyExpression`] for blank text and
    /// propagates registry failures.
    pub fn new(
        owner: impl Into<String>,
        expression_text: &str,
        format: Option<String>,
        registry: &VariableRegistry,
        state_provider: Option<Arc<dyn StateProvider>>,
    ) -> Result<Arc<Formula>, FormulaError> {
        let owner = owner.into();
        let trimmed = expression_text.trim();
        if trimmed.is_empty() {
            return Err(FormulaError::EmptyExpression { owner });
        }

        let expression = Expression::parse(trimmed);
        let id = Uuid::new_v5(&FORMULA_NAMESPACE, format!("{owner}:{trimmed}").as_bytes());
        let cell_type = if format.is_some() {
            DataType::Text
        } else {
            DataType::Float
        };
        let cell = registry.get_or_create(&format!("{INTERNAL_PREFIX}formula:{id}"), cell_type)?;

        let mut dependencies = HashMap::new();
        for name in expression.dependency_names() {
            let variable = registry.get_or_create(name, DataType::Float)?;
            dependencies.insert(name.to_string(), variable);
        }
        debug!(
            "formula {owner} ({id}) depends on {} variable(s)",
            dependencies.len()
        );

        let formula = Arc::new(Formula {
            id,
            owner,
            expression,
            cell,
            dependencies,
            format,
            state_provider,
        });
        let as_listener: Arc<dyn VariableListener> = formula.clone();
        for variable in formula.dependencies.values() {
            variable.add_listener(&as_listener);
        }
        formula.recompute();
        Ok(formula)
    }

    /// Deterministic identity derived from owner and expression text.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn expression(&self) -> &Expression {
        &self.expression
    }

    /// The output cell. Listen on this to observe the computed value.
    pub fn variable(&self) -> &Arc<Variable> {
        &self.cell
    }

    /// Names of the registry variables this formula listens on.
    pub fn dependency_names(&self) -> Vec<&str> {
        self.dependencies.keys().map(String::as_str).collect()
    }

    /// Unregisters this formula from every dependency; no further dependency
    /// change will trigger a recomputation.
    pub fn detach(self: &Arc<Self>) {
        let as_listener: Arc<dyn VariableListener> = self.clone();
        for variable in self.dependencies.values() {
            variable.remove_listener(&as_listener);
        }
    }

    /// Re-evaluates the expression against current values and publishes the
    /// result through the output cell.
    ///
    /// Runs automatically on dependency changes; call it directly after an
    /// activation-layer `state:` value moved, since those have no variable
    /// to listen on. An evaluation failure is logged and leaves the previous
    /// value in place.
    pub fn recompute(&self) {
        match self.evaluate() {
            Ok(value) => {
                let value = value.map(|v| self.apply_format(v));
                self.cell.update_value(value, true);
            }
            Err(error) => {
                warn!(
                    "formula {} not updated: {error} in '{}'",
                    self.owner, self.expression
                );
            }
        }
    }

    fn evaluate(&self) -> Result<Option<Value>, RpnError> {
        match &self.expression {
            Expression::Constant(number) => Ok(Some(Value::Float(*number))),
            Expression::Reference { name, kind } => Ok(self.reference_value(name, *kind)),
            Expression::Template { .. } => {
                let text = self
                    .expression
                    .substitute(|token| self.resolve_token(token));
                rpn::evaluate(&text).map(|number| Some(Value::Float(number)))
            }
        }
    }

    /// Raw value of a bare reference; the variable's value passes through
    /// untouched, whatever its type.
    fn reference_value(&self, name: &str, kind: VariableKind) -> Option<Value> {
        match kind {
            VariableKind::State => {
                let provider = self.state_provider.as_ref()?;
                let raw = provider.state_value(state_root(name))?;
                Some(match raw.parse::<f64>() {
                    Ok(number) => Value::Float(number),
                    Err(_) => Value::Text(raw),
                })
            }
            VariableKind::Internal | VariableKind::Remote => {
                self.dependencies.get(name).and_then(|v| v.value())
            }
        }
    }

    fn resolve_token(&self, token: &TokenRef) -> Option<String> {
        match token.kind {
            TokenKind::Internal | TokenKind::Remote => self
                .dependencies
                .get(&token.name)
                .and_then(|v| v.value())
                .map(|v| v.to_string()),
            TokenKind::State => self
                .state_provider
                .as_ref()
                .and_then(|p| p.state_value(state_root(&token.name))),
            TokenKind::Icon | TokenKind::Opaque => None,
        }
    }

    /// Applies the optional format string. Only numeric results are
    /// formatted; anything else passes through in plain string form with a
    /// warning.
    fn apply_format(&self, value: Value) -> Value {
        let Some(pattern) = &self.format else {
            return value;
        };
        match value.as_f64() {
            Some(number) => match render_format(pattern, number) {
                Some(text) => Value::Text(text),
                None => {
                    warn!(
                        "format '{pattern}' on formula {} has no placeholder; using plain form",
                        self.owner
                    );
                    Value::Text(value.to_string())
                }
            },
            None => {
                warn!(
                    "formula {} produced non-numeric {value:?}; format '{pattern}' skipped",
                    self.owner
                );
                Value::Text(value.to_string())
            }
        }
    }
}

impl VariableListener for Formula {
    fn variable_changed(&self, variable: &Variable) {
        debug!("formula {} recomputing after {}", self.owner, variable.name());
        self.recompute();
    }

    fn listener_name(&self) -> &str {
        &self.owner
    }
}

// ── Formatting ────────────────────────────────────────────────────────────────

/// Renders `value` into the `{...}` placeholder of `pattern`, honoring an
/// optional `.N` decimal precision (`"ALT {:.0f} ft"` style). Returns `None`
/// when the pattern has no placeholder.
fn render_format(pattern: &str, value: f64) -> Option<String> {
    let start = pattern.find('{')?;
    let end = start + pattern[start..].find('}')?;
    let placeholder = &pattern[start + 1..end];
    let rendered = match placeholder_precision(placeholder) {
        Some(decimals) => format!("{value:.decimals$}"),
        None => value.to_string(),
    };
    Some(format!("{}{rendered}{}", &pattern[..start], &pattern[end + 1..]))
}

fn placeholder_precision(placeholder: &str) -> Option<usize> {
    let dot = placeholder.find('.')?;
    let digits: String = placeholder[dot + 1..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

fn state_root(name: &str) -> &str {
    name.strip_prefix(STATE_PREFIX).unwrap_or(name)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn set(registry: &VariableRegistry, name: &str, value: f64) {
        registry
            .get(name)
            .unwrap_or_else(|| panic!("{name} not registered"))
            .update_value(Some(Value::Float(value)), true);
    }

    #[test]
    fn test_constant_formula() {
        let registry = VariableRegistry::new();
        let formula = Formula::new("test", "7.5", None, &registry, None).unwrap();
        assert_eq!(formula.variable().value(), Some(Value::Float(7.5)));
        assert_eq!(formula.variable().updated_count(), 1);
    }

    #[test]
    fn test_empty_expression_is_rejected() {
        let registry = VariableRegistry::new();
        let result = Formula::new("test", "   ", None, &registry, None);
        assert!(matches!(result, Err(FormulaError::EmptyExpression { .. })));
    }

    #[test]
    fn test_abs_difference_is_symmetric() {
        let registry = VariableRegistry::new();
        let formula =
            Formula::new("test", "${data:a} ${data:b} - abs", None, &registry, None).unwrap();

        set(&registry, "data:a", 3.0);
        set(&registry, "data:b", 10.0);
        assert_eq!(formula.variable().value(), Some(Value::Float(7.0)));

        set(&registry, "data:a", 10.0);
        set(&registry, "data:b", 3.0);
        assert_eq!(formula.variable().value(), Some(Value::Float(7.0)));
    }

    #[test]
    fn test_duplicate_reference_recomputes_once_per_change() {
        let registry = VariableRegistry::new();
        let formula =
            Formula::new("test", "${data:a} ${data:a} +", None, &registry, None).unwrap();
        // Initial computation with the default substitution.
        assert_eq!(formula.variable().value(), Some(Value::Float(0.0)));
        assert_eq!(formula.variable().updated_count(), 1);

        set(&registry, "data:a", 3.0);
        assert_eq!(formula.variable().value(), Some(Value::Float(6.0)));
        assert_eq!(
            formula.variable().updated_count(),
            2,
            "one dependency change must drive exactly one recomputation"
        );
    }

    #[test]
    fn test_evaluation_failure_keeps_previous_value() {
        let registry = VariableRegistry::new();
        let formula =
            Formula::new("test", "${data:a} ${data:b} /", None, &registry, None).unwrap();
        // b defaults to 0.0 so far, so every attempt divides by zero.
        assert_eq!(formula.variable().value(), None);

        set(&registry, "data:a", 6.0);
        set(&registry, "data:b", 2.0);
        assert_eq!(formula.variable().value(), Some(Value::Float(3.0)));
        assert_eq!(formula.variable().updated_count(), 1);

        set(&registry, "data:b", 0.0);
        assert_eq!(
            formula.variable().value(),
            Some(Value::Float(3.0)),
            "failed evaluation must leave the previous value"
        );
        assert_eq!(formula.variable().updated_count(), 1);
    }

    #[test]
    fn test_state_values_come_from_the_provider() {
        let registry = VariableRegistry::new();
        let mut provider = MockStateProvider::new();
        provider
            .expect_state_value()
            .withf(|name| name == "armed")
            .returning(|_| Some("1".to_string()));
        let provider: Arc<dyn StateProvider> = Arc::new(provider);

        let formula = Formula::new(
            "test",
            "${state:armed} 1 eq",
            None,
            &registry,
            Some(provider),
        )
        .unwrap();
        assert_eq!(formula.variable().value(), Some(Value::Float(1.0)));
        assert!(
            formula.dependency_names().is_empty(),
            "state names are not registry dependencies"
        );
    }

    #[test]
    fn test_missing_state_provider_falls_back_to_default() {
        let registry = VariableRegistry::new();
        let formula =
            Formula::new("test", "${state:armed} 1 eq", None, &registry, None).unwrap();
        assert_eq!(formula.variable().value(), Some(Value::Float(0.0)));
    }

    #[test]
    fn test_bare_reference_mirrors_raw_value() {
        let registry = VariableRegistry::new();
        let formula = Formula::new(
            "test",
            "sim/cockpit/autopilot/mode",
            None,
            &registry,
            None,
        )
        .unwrap();
        assert_eq!(formula.variable().value(), None);

        let dep = registry.get("sim/cockpit/autopilot/mode").unwrap();
        dep.update_value(Some(Value::Text("VNAV".to_string())), true);
        assert_eq!(
            formula.variable().value(),
            Some(Value::Text("VNAV".to_string()))
        );
    }

    #[test]
    fn test_format_applies_to_numeric_results() {
        let registry = VariableRegistry::new();
        let formula = Formula::new(
            "test",
            "${data:alt} 3.28084 *",
            Some("ALT {:.0f} ft".to_string()),
            &registry,
            None,
        )
        .unwrap();
        set(&registry, "data:alt", 1000.0);
        assert_eq!(
            formula.variable().value(),
            Some(Value::Text("ALT 3281 ft".to_string()))
        );
    }

    #[test]
    fn test_format_precision() {
        let registry = VariableRegistry::new();
        let formula = Formula::new(
            "test",
            "2.71828",
            Some("{:.2f}".to_string()),
            &registry,
            None,
        )
        .unwrap();
        assert_eq!(
            formula.variable().value(),
            Some(Value::Text("2.72".to_string()))
        );
    }

    #[test]
    fn test_format_skipped_for_non_numeric_result() {
        let registry = VariableRegistry::new();
        let formula = Formula::new(
            "test",
            "sim/cockpit/autopilot/mode",
            Some("{:.1f}".to_string()),
            &registry,
            None,
        )
        .unwrap();
        let dep = registry.get("sim/cockpit/autopilot/mode").unwrap();
        dep.update_value(Some(Value::Text("LNAV".to_string())), true);
        assert_eq!(
            formula.variable().value(),
            Some(Value::Text("LNAV".to_string()))
        );
    }

    #[test]
    fn test_detach_stops_recomputation() {
        let registry = VariableRegistry::new();
        let formula =
            Formula::new("test", "${data:a} abs", None, &registry, None).unwrap();
        let dep = registry.get("data:a").unwrap();
        assert_eq!(dep.listener_count(), 1);

        formula.detach();
        assert_eq!(dep.listener_count(), 0);

        set(&registry, "data:a", -4.0);
        assert_eq!(
            formula.variable().value(),
            Some(Value::Float(0.0)),
            "detached formula keeps its last computed value"
        );
    }

    #[test]
    fn test_formula_cascades_into_dependent_formula() {
        let registry = VariableRegistry::new();
        let inner =
            Formula::new("inner", "${data:a} 2 *", None, &registry, None).unwrap();
        let outer_text = format!("${{{}}} 1 +", inner.variable().name());
        let outer = Formula::new("outer", &outer_text, None, &registry, None).unwrap();

        set(&registry, "data:a", 5.0);
        assert_eq!(inner.variable().value(), Some(Value::Float(10.0)));
        assert_eq!(outer.variable().value(), Some(Value::Float(11.0)));
    }

    #[test]
    fn test_identity_is_deterministic() {
        let registry = VariableRegistry::new();
        let a = Formula::new("w", "${data:a} abs", None, &registry, None).unwrap();
        let b = Formula::new("w", "${data:a} abs", None, &registry, None).unwrap();
        let c = Formula::new("w", "${data:a} chs", None, &registry, None).unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_render_format_variants() {
        assert_eq!(render_format("{:.1f}", 2.25).as_deref(), Some("2.2"));
        assert_eq!(render_format("{}", 4.5).as_deref(), Some("4.5"));
        assert_eq!(
            render_format("fuel {:.0f} kg", 1234.4).as_deref(),
            Some("fuel 1234 kg")
        );
        assert_eq!(render_format("no placeholder", 1.0), None);
    }
}
