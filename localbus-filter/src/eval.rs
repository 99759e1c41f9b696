//! Filter evaluation
//!
//! Tree-walking evaluation of a parsed filter against a property map, with
//! three-valued logic for null handling:
//! - `Bool(true)`: condition satisfied
//! - `Bool(false)`: condition not satisfied
//! - `Null`: condition cannot be determined (null operand)

use crate::functions::FunctionRegistry;
use crate::parser::{BinaryOp, Expr, UnaryOp};
use crate::types::{PropertyMap, Value};
use localbus_core::FilterError;
use std::time::{Duration, Instant};

// ============================================================================
// SINGLE-EXPRESSION EVALUATOR
// ============================================================================

/// Evaluates one filter against one property map.
///
/// Not thread-safe; create one instance per evaluation. The function registry
/// it borrows IS shareable.
pub struct FilterEvaluator<'a> {
    properties: &'a PropertyMap,
    registry: &'a FunctionRegistry,
    case_sensitive_properties: bool,
}

impl<'a> FilterEvaluator<'a> {
    pub fn new(
        properties: &'a PropertyMap,
        registry: &'a FunctionRegistry,
        case_sensitive_properties: bool,
    ) -> Self {
        Self {
            properties,
            registry,
            case_sensitive_properties,
        }
    }

    /// Evaluate the expression to a value. Boolean filters produce
    /// `Bool(..)` or `Null`.
    pub fn evaluate(&self, expr: &Expr) -> Result<Value, FilterError> {
        match expr {
            Expr::Literal { value, .. } => Ok(value.clone()),
            Expr::Property { name, .. } => Ok(self.lookup(name)),
            Expr::Unary { op, operand, .. } => self.eval_unary(*op, operand),
            Expr::Binary {
                op, left, right, ..
            } => self.eval_binary(*op, left, right),
            Expr::Call { function, args, .. } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.evaluate(arg)?);
                }
                self.registry.call(function, &values)
            }
        }
    }

    /// Null-safe property access. A missing property reads as null.
    fn lookup(&self, name: &str) -> Value {
        if let Some(value) = self.properties.get(name) {
            return value.clone();
        }
        if !self.case_sensitive_properties {
            for (key, value) in self.properties {
                if key.eq_ignore_ascii_case(name) {
                    return value.clone();
                }
            }
        }
        Value::Null
    }

    fn eval_unary(&self, op: UnaryOp, operand: &Expr) -> Result<Value, FilterError> {
        let value = self.evaluate(operand)?;
        match op {
            UnaryOp::Not => match value {
                Value::Null => Ok(Value::Null),
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(FilterError::Evaluation {
                    message: format!(
                        "'not' requires a boolean operand, got {}",
                        other.edm_type().as_str()
                    ),
                }),
            },
            UnaryOp::Neg => match value {
                Value::Null => Ok(Value::Null),
                Value::Int32(n) => Ok(Value::Int32(-n)),
                Value::Int64(n) => Ok(Value::Int64(-n)),
                Value::Double(n) => Ok(Value::Double(-n)),
                other => Err(FilterError::Evaluation {
                    message: format!(
                        "'-' requires a numeric operand, got {}",
                        other.edm_type().as_str()
                    ),
                }),
            },
        }
    }

    fn eval_binary(&self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Value, FilterError> {
        // Logical operators short-circuit on their dominant value.
        match op {
            BinaryOp::And => return self.eval_and(left, right),
            BinaryOp::Or => return self.eval_or(left, right),
            _ => {}
        }

        let lhs = self.evaluate(left)?;
        let rhs = self.evaluate(right)?;

        if lhs.is_null() || rhs.is_null() {
            return Ok(match op {
                // null eq null is true; null against a value is not.
                BinaryOp::Eq => Value::Bool(lhs.is_null() && rhs.is_null()),
                BinaryOp::Ne => Value::Bool(!(lhs.is_null() && rhs.is_null())),
                _ => Value::Null,
            });
        }

        match op {
            BinaryOp::Eq => Ok(Value::Bool(compare_eq(&lhs, &rhs))),
            BinaryOp::Ne => Ok(Value::Bool(!compare_eq(&lhs, &rhs))),
            BinaryOp::Gt => compare_order(&lhs, &rhs).map(|o| Value::Bool(o == std::cmp::Ordering::Greater)),
            BinaryOp::Ge => compare_order(&lhs, &rhs).map(|o| Value::Bool(o != std::cmp::Ordering::Less)),
            BinaryOp::Lt => compare_order(&lhs, &rhs).map(|o| Value::Bool(o == std::cmp::Ordering::Less)),
            BinaryOp::Le => compare_order(&lhs, &rhs).map(|o| Value::Bool(o != std::cmp::Ordering::Greater)),
            BinaryOp::Add => arithmetic(op, &lhs, &rhs),
            BinaryOp::Sub => arithmetic(op, &lhs, &rhs),
            BinaryOp::Mul => arithmetic(op, &lhs, &rhs),
            BinaryOp::Div => arithmetic(op, &lhs, &rhs),
            BinaryOp::Mod => arithmetic(op, &lhs, &rhs),
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    /// Truth table: false and * = false; true and true = true; else null.
    fn eval_and(&self, left: &Expr, right: &Expr) -> Result<Value, FilterError> {
        let lhs = self.truthiness(left)?;
        if lhs == Some(false) {
            return Ok(Value::Bool(false));
        }
        let rhs = self.truthiness(right)?;
        if rhs == Some(false) {
            return Ok(Value::Bool(false));
        }
        if lhs == Some(true) && rhs == Some(true) {
            return Ok(Value::Bool(true));
        }
        Ok(Value::Null)
    }

    /// Truth table: true or * = true; false or false = false; else null.
    fn eval_or(&self, left: &Expr, right: &Expr) -> Result<Value, FilterError> {
        let lhs = self.truthiness(left)?;
        if lhs == Some(true) {
            return Ok(Value::Bool(true));
        }
        let rhs = self.truthiness(right)?;
        if rhs == Some(true) {
            return Ok(Value::Bool(true));
        }
        if lhs == Some(false) && rhs == Some(false) {
            return Ok(Value::Bool(false));
        }
        Ok(Value::Null)
    }

    fn truthiness(&self, expr: &Expr) -> Result<Option<bool>, FilterError> {
        match self.evaluate(expr)? {
            Value::Null => Ok(None),
            Value::Bool(b) => Ok(Some(b)),
            other => Err(FilterError::Evaluation {
                message: format!(
                    "Logical operator requires boolean operands, got {}",
                    other.edm_type().as_str()
                ),
            }),
        }
    }
}

/// Equality: strings compare case-insensitively, numerics compare after
/// promotion, mismatched non-numeric types are simply unequal.
fn compare_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::DateTime(a), Value::DateTime(b)) => a == b,
        (Value::Guid(a), Value::Guid(b)) => a == b,
        (Value::Binary(a), Value::Binary(b)) => a == b,
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

/// Ordering for numerics (after promotion), strings (lexicographic, as the
/// storage key ordering requires), and datetimes.
fn compare_order(left: &Value, right: &Value) -> Result<std::cmp::Ordering, FilterError> {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        return Ok(a.cmp(&b));
    }
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a.partial_cmp(&b).ok_or(FilterError::Evaluation {
            message: "Cannot order NaN values".to_string(),
        });
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(a.as_str().cmp(b.as_str())),
        (Value::DateTime(a), Value::DateTime(b)) => Ok(a.cmp(b)),
        _ => Err(FilterError::Evaluation {
            message: format!(
                "Cannot order {} against {}",
                left.edm_type().as_str(),
                right.edm_type().as_str()
            ),
        }),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, FilterError> {
    let both_integer = left.as_i64().is_some() && right.as_i64().is_some();

    // Division always promotes to double; zero divisors raise.
    if op == BinaryOp::Div {
        let (a, b) = promote_f64(op, left, right)?;
        if b == 0.0 {
            return Err(FilterError::Evaluation {
                message: "Division by zero".to_string(),
            });
        }
        return Ok(Value::Double(a / b));
    }

    if op == BinaryOp::Mod {
        if both_integer {
            let (a, b) = (left.as_i64().unwrap(), right.as_i64().unwrap());
            if b == 0 {
                return Err(FilterError::Evaluation {
                    message: "Modulo by zero".to_string(),
                });
            }
            return Ok(Value::from_int(a.rem_euclid(b)));
        }
        let (a, b) = promote_f64(op, left, right)?;
        if b == 0.0 {
            return Err(FilterError::Evaluation {
                message: "Modulo by zero".to_string(),
            });
        }
        return Ok(Value::Double(a.rem_euclid(b)));
    }

    if both_integer {
        let (a, b) = (left.as_i64().unwrap(), right.as_i64().unwrap());
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            _ => unreachable!(),
        };
        return result.map(Value::from_int).ok_or(FilterError::Evaluation {
            message: "Integer overflow".to_string(),
        });
    }

    let (a, b) = promote_f64(op, left, right)?;
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        _ => unreachable!(),
    };
    Ok(Value::Double(result))
}

fn promote_f64(op: BinaryOp, left: &Value, right: &Value) -> Result<(f64, f64), FilterError> {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(FilterError::Evaluation {
            message: format!(
                "Arithmetic operator '{}' requires numeric operands, got {} and {}",
                op.as_str(),
                left.edm_type().as_str(),
                right.edm_type().as_str()
            ),
        }),
    }
}

// ============================================================================
// QUERY EVALUATOR
// ============================================================================

/// Evaluation counters for one query pass.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EvaluatorMetrics {
    pub entities_scanned: u64,
    pub entities_matched: u64,
    pub elapsed: Duration,
}

/// Batch evaluator with a deadline, scan metrics, and projection support.
///
/// Not thread-safe; one instance per query. The registry it owns can be
/// cloned out and shared.
pub struct QueryEvaluator {
    timeout: Duration,
    registry: FunctionRegistry,
    case_sensitive_properties: bool,
    metrics: EvaluatorMetrics,
}

/// Properties every projection keeps, matching the storage emulation's
/// distinguished columns.
const ALWAYS_PROJECTED: &[&str] = &["PartitionKey", "RowKey", "Timestamp"];

impl QueryEvaluator {
    pub fn new(timeout: Duration) -> Self {
        Self::with_options(timeout, FunctionRegistry::new(), false)
    }

    pub fn with_options(
        timeout: Duration,
        registry: FunctionRegistry,
        case_sensitive_properties: bool,
    ) -> Self {
        Self {
            timeout,
            registry,
            case_sensitive_properties,
            metrics: EvaluatorMetrics::default(),
        }
    }

    /// Evaluate one filter against one property map. A null result reads as
    /// "no match". `None` matches everything.
    pub fn matches(
        &self,
        filter: Option<&Expr>,
        properties: &PropertyMap,
    ) -> Result<bool, FilterError> {
        let Some(expr) = filter else {
            return Ok(true);
        };
        let evaluator =
            FilterEvaluator::new(properties, &self.registry, self.case_sensitive_properties);
        match evaluator.evaluate(expr)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(FilterError::Evaluation {
                message: format!(
                    "Filter must evaluate to a boolean, got {}",
                    other.edm_type().as_str()
                ),
            }),
        }
    }

    /// Filter a slice of entities with skip/top pagination, enforcing the
    /// deadline mid-scan.
    pub fn filter_entities(
        &mut self,
        filter: Option<&Expr>,
        entities: &[PropertyMap],
        skip: Option<usize>,
        top: Option<usize>,
    ) -> Result<Vec<PropertyMap>, FilterError> {
        let started = Instant::now();
        let mut results = Vec::new();
        let mut skipped = 0usize;

        self.metrics.entities_scanned = 0;
        self.metrics.entities_matched = 0;

        for entity in entities {
            let elapsed = started.elapsed();
            if elapsed > self.timeout {
                self.metrics.elapsed = elapsed;
                return Err(FilterError::Timeout {
                    elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                    limit_ms: self.timeout.as_secs_f64() * 1000.0,
                });
            }

            self.metrics.entities_scanned += 1;

            if self.matches(filter, entity)? {
                if let Some(skip) = skip {
                    if skipped < skip {
                        skipped += 1;
                        continue;
                    }
                }

                self.metrics.entities_matched += 1;
                results.push(entity.clone());

                if let Some(top) = top {
                    if results.len() >= top {
                        break;
                    }
                }
            }
        }

        self.metrics.elapsed = started.elapsed();
        Ok(results)
    }

    /// Project an entity down to the selected properties plus the
    /// distinguished columns.
    pub fn project(&self, entity: &PropertyMap, select: Option<&[String]>) -> PropertyMap {
        let Some(select) = select else {
            return entity.clone();
        };

        let keep = |key: &str| {
            let hit = |name: &str| {
                if self.case_sensitive_properties {
                    key == name
                } else {
                    key.eq_ignore_ascii_case(name)
                }
            };
            ALWAYS_PROJECTED.iter().any(|name| hit(name))
                || select.iter().any(|name| hit(name))
        };

        entity
            .iter()
            .filter(|(key, _)| keep(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn metrics(&self) -> EvaluatorMetrics {
        self.metrics
    }

    pub fn reset_metrics(&mut self) {
        self.metrics = EvaluatorMetrics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;

    fn props(pairs: &[(&str, Value)]) -> PropertyMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn eval(filter: &str, properties: &PropertyMap) -> bool {
        let ast = compile(filter).expect("filter should compile");
        QueryEvaluator::new(Duration::from_secs(5))
            .matches(ast.as_ref(), properties)
            .expect("filter should evaluate")
    }

    #[test]
    fn test_comparison_with_promotion() {
        let entity = props(&[("Price", Value::Double(75.0))]);
        assert!(eval("Price gt 50", &entity));
        assert!(!eval("Price gt 100", &entity));
        assert!(eval("Price eq 75", &entity));
    }

    #[test]
    fn test_string_equality_case_insensitive() {
        let entity = props(&[("Region", Value::String("US".into()))]);
        assert!(eval("Region eq 'us'", &entity));
        assert!(!eval("Region ne 'Us'", &entity));
    }

    #[test]
    fn test_missing_property_is_null() {
        let entity = props(&[]);
        assert!(eval("Missing eq null", &entity));
        // null gt anything is indeterminate, which reads as no-match
        assert!(!eval("Missing gt 5", &entity));
    }

    #[test]
    fn test_property_lookup_case_insensitive() {
        let entity = props(&[("priority", Value::String("high".into()))]);
        assert!(eval("Priority eq 'high'", &entity));
    }

    #[test]
    fn test_three_valued_and_or() {
        let entity = props(&[("A", Value::Bool(true))]);
        // B is missing (null): true and null -> null -> no match
        assert!(!eval("A eq true and B eq true", &entity));
        // true or null short-circuits to true
        assert!(eval("A eq true or B eq true", &entity));
        // false and null short-circuits to false
        assert!(!eval("A eq false and B eq true", &entity));
    }

    #[test]
    fn test_not_null_is_null() {
        let entity = props(&[]);
        assert!(!eval("not (Missing eq 1)", &entity));
    }

    #[test]
    fn test_division_by_zero_raises() {
        let entity = props(&[("X", Value::Int32(1))]);
        let ast = compile("X div 0 eq 1").expect("compiles");
        let result =
            QueryEvaluator::new(Duration::from_secs(5)).matches(ast.as_ref(), &entity);
        assert!(matches!(result, Err(FilterError::Evaluation { .. })));
    }

    #[test]
    fn test_arithmetic() {
        let entity = props(&[("X", Value::Int32(7))]);
        assert!(eval("X add 3 eq 10", &entity));
        assert!(eval("X mul 2 eq 14", &entity));
        assert!(eval("X mod 2 eq 1", &entity));
        assert!(eval("X div 2 eq 3.5", &entity));
    }

    #[test]
    fn test_unary_minus() {
        let entity = props(&[("X", Value::Int32(7)), ("R", Value::Double(0.5))]);
        assert!(eval("-X eq -7", &entity));
        assert!(eval("-(X add 3) eq -10", &entity));
        // Negation binds tighter than the multiplicative operators.
        assert!(eval("-X mul 2 eq -14", &entity));
        assert!(eval("-R lt 0", &entity));
        // Negating a missing property propagates null.
        assert!(eval("-Missing eq null", &entity));
    }

    #[test]
    fn test_unary_minus_on_non_numeric_raises() {
        let entity = props(&[("Name", Value::String("x".into()))]);
        let ast = compile("-Name eq 'x'").expect("compiles; property type is unknown statically");
        let result =
            QueryEvaluator::new(Duration::from_secs(5)).matches(ast.as_ref(), &entity);
        assert!(matches!(result, Err(FilterError::Evaluation { .. })));
    }

    #[test]
    fn test_function_in_filter() {
        let entity = props(&[("Name", Value::String("HelloWorld".into()))]);
        assert!(eval("startswith(Name, 'hello')", &entity));
        assert!(eval("length(Name) eq 10", &entity));
        assert!(!eval("endswith(Name, 'xyz')", &entity));
    }

    #[test]
    fn test_filter_entities_with_pagination() {
        let entities: Vec<PropertyMap> = (0..10)
            .map(|i| props(&[("N", Value::Int32(i))]))
            .collect();
        let ast = compile("N ge 2").expect("compiles");
        let mut evaluator = QueryEvaluator::new(Duration::from_secs(5));
        let results = evaluator
            .filter_entities(ast.as_ref(), &entities, Some(1), Some(3))
            .expect("should filter");
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["N"], Value::Int32(3));
        assert_eq!(evaluator.metrics().entities_scanned, 6);
    }

    #[test]
    fn test_projection_keeps_distinguished_columns() {
        let entity = props(&[
            ("PartitionKey", Value::String("P1".into())),
            ("RowKey", Value::String("R1".into())),
            ("Name", Value::String("x".into())),
            ("Price", Value::Int32(10)),
        ]);
        let evaluator = QueryEvaluator::new(Duration::from_secs(5));
        let projected = evaluator.project(&entity, Some(&["Name".to_string()]));
        assert!(projected.contains_key("PartitionKey"));
        assert!(projected.contains_key("Name"));
        assert!(!projected.contains_key("Price"));
    }
}
