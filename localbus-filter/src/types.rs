//! EDM type system and runtime values
//!
//! Implements the OData v3 primitive type set with numeric promotion,
//! comparability and ordering rules, and the static type checker run over a
//! parsed filter before it is accepted.

use crate::parser::{BinaryOp, Expr, UnaryOp};
use crate::functions::FunctionRegistry;
use chrono::{DateTime, Utc};
use localbus_core::{FilterError, PropertyValue, SourcePosition};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Property map a filter is evaluated against.
pub type PropertyMap = BTreeMap<String, Value>;

// ============================================================================
// EDM TYPES
// ============================================================================

/// Entity Data Model primitive types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdmType {
    String,
    Int32,
    Int64,
    Double,
    Boolean,
    DateTime,
    Guid,
    Binary,
    Null,
}

impl EdmType {
    /// The canonical `Edm.*` name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EdmType::String => "Edm.String",
            EdmType::Int32 => "Edm.Int32",
            EdmType::Int64 => "Edm.Int64",
            EdmType::Double => "Edm.Double",
            EdmType::Boolean => "Edm.Boolean",
            EdmType::DateTime => "Edm.DateTime",
            EdmType::Guid => "Edm.Guid",
            EdmType::Binary => "Edm.Binary",
            EdmType::Null => "Edm.Null",
        }
    }

    /// Look up a type by its `Edm.*` name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Edm.String" => Some(EdmType::String),
            "Edm.Int32" => Some(EdmType::Int32),
            "Edm.Int64" => Some(EdmType::Int64),
            "Edm.Double" => Some(EdmType::Double),
            "Edm.Boolean" => Some(EdmType::Boolean),
            "Edm.DateTime" => Some(EdmType::DateTime),
            "Edm.Guid" => Some(EdmType::Guid),
            "Edm.Binary" => Some(EdmType::Binary),
            "Edm.Null" => Some(EdmType::Null),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, EdmType::Int32 | EdmType::Int64 | EdmType::Double)
    }

    /// Whether two types may appear on either side of eq/ne.
    pub fn is_comparable(&self, other: EdmType) -> bool {
        if *self == EdmType::Null || other == EdmType::Null {
            return true;
        }
        if self.is_numeric() && other.is_numeric() {
            return true;
        }
        *self == other
    }

    /// Whether the type supports gt/ge/lt/le.
    pub fn supports_ordering(&self) -> bool {
        matches!(
            self,
            EdmType::Int32 | EdmType::Int64 | EdmType::Double | EdmType::DateTime
        )
    }

    /// Numeric promotion: Int32 < Int64 < Double.
    pub fn promote(self, other: EdmType) -> EdmType {
        fn rank(t: EdmType) -> u8 {
            match t {
                EdmType::Int32 => 1,
                EdmType::Int64 => 2,
                EdmType::Double => 3,
                _ => 0,
            }
        }
        if rank(self) >= rank(other) {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for EdmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// RUNTIME VALUES
// ============================================================================

/// A runtime value flowing through the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Guid(Uuid),
    Binary(Vec<u8>),
}

impl Value {
    pub fn edm_type(&self) -> EdmType {
        match self {
            Value::Null => EdmType::Null,
            Value::Bool(_) => EdmType::Boolean,
            Value::Int32(_) => EdmType::Int32,
            Value::Int64(_) => EdmType::Int64,
            Value::Double(_) => EdmType::Double,
            Value::String(_) => EdmType::String,
            Value::DateTime(_) => EdmType::DateTime,
            Value::Guid(_) => EdmType::Guid,
            Value::Binary(_) => EdmType::Binary,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer values that fit in 32 bits classify as Int32, larger as Int64.
    pub fn from_int(n: i64) -> Self {
        if let Ok(small) = i32::try_from(n) {
            Value::Int32(small)
        } else {
            Value::Int64(n)
        }
    }

    /// Bridge a message user-property into the evaluator's value space.
    pub fn from_property(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Null => Value::Null,
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Int(n) => Value::from_int(*n),
            PropertyValue::Float(f) => Value::Double(*f),
            PropertyValue::String(s) => Value::String(s.clone()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(n) => Some(*n as f64),
            Value::Int64(n) => Some(*n as f64),
            Value::Double(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(n) => Some(*n as i64),
            Value::Int64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int32(n) => write!(f, "{}", n),
            Value::Int64(n) => write!(f, "{}L", n),
            Value::Double(n) => write!(f, "{:?}", n),
            Value::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::DateTime(dt) => write!(f, "datetime'{}'", dt.to_rfc3339()),
            Value::Guid(g) => write!(f, "guid'{}'", g),
            Value::Binary(b) => write!(f, "binary({} bytes)", b.len()),
        }
    }
}

// ============================================================================
// STATIC TYPE CHECKER
// ============================================================================

/// Static type checker run after parsing.
///
/// Property types are unknown until evaluation, so the checker reasons with
/// `Option<EdmType>`: `None` marks a property-dependent subexpression that is
/// compatible with anything. Violations between statically-known operands are
/// rejected here; everything else is deferred to the evaluator.
pub struct TypeChecker<'a> {
    registry: &'a FunctionRegistry,
}

impl<'a> TypeChecker<'a> {
    pub fn new(registry: &'a FunctionRegistry) -> Self {
        Self { registry }
    }

    /// Check an expression, returning its static type when one is known.
    pub fn check(&self, expr: &Expr) -> Result<Option<EdmType>, FilterError> {
        match expr {
            Expr::Literal { value, .. } => Ok(Some(value.edm_type())),
            Expr::Property { .. } => Ok(None),
            Expr::Unary {
                op,
                operand,
                position,
            } => {
                let inner = self.check(operand)?;
                match op {
                    UnaryOp::Not => {
                        if let Some(t) = inner {
                            if t != EdmType::Boolean && t != EdmType::Null {
                                return Err(type_error(
                                    "Logical 'not' requires a boolean operand",
                                    EdmType::Boolean,
                                    t,
                                    *position,
                                ));
                            }
                        }
                        Ok(Some(EdmType::Boolean))
                    }
                    UnaryOp::Neg => {
                        if let Some(t) = inner {
                            if !t.is_numeric() && t != EdmType::Null {
                                return Err(type_error(
                                    "Unary '-' requires a numeric operand",
                                    EdmType::Double,
                                    t,
                                    *position,
                                ));
                            }
                            Ok(Some(t))
                        } else {
                            Ok(None)
                        }
                    }
                }
            }
            Expr::Binary {
                op,
                left,
                right,
                position,
            } => {
                let lt = self.check(left)?;
                let rt = self.check(right)?;
                self.check_binary(*op, lt, rt, *position)
            }
            Expr::Call {
                function,
                args,
                position,
            } => {
                let mut arg_types = Vec::with_capacity(args.len());
                for arg in args {
                    arg_types.push(self.check(arg)?);
                }
                self.registry.check_call(function, &arg_types, *position)
            }
        }
    }

    fn check_binary(
        &self,
        op: BinaryOp,
        left: Option<EdmType>,
        right: Option<EdmType>,
        position: SourcePosition,
    ) -> Result<Option<EdmType>, FilterError> {
        if op.is_logical() {
            for side in [left, right].into_iter().flatten() {
                if side != EdmType::Boolean && side != EdmType::Null {
                    return Err(type_error(
                        &format!("Logical '{}' requires boolean operands", op.as_str()),
                        EdmType::Boolean,
                        side,
                        position,
                    ));
                }
            }
            return Ok(Some(EdmType::Boolean));
        }

        if op.is_comparison() {
            if let (Some(lt), Some(rt)) = (left, right) {
                if !lt.is_comparable(rt) {
                    return Err(type_error(
                        &format!("Cannot compare {} with {}", lt.as_str(), rt.as_str()),
                        lt,
                        rt,
                        position,
                    ));
                }
                if op.is_ordering() {
                    // Ordering against null only supports eq/ne.
                    if lt == EdmType::Null || rt == EdmType::Null {
                        return Err(FilterError::Type {
                            message: format!(
                                "Cannot use '{}' with null values",
                                op.as_str()
                            ),
                            expected: "Edm.Int32, Edm.Int64, Edm.Double, Edm.DateTime".to_string(),
                            actual: EdmType::Null.as_str().to_string(),
                            position: Some(position),
                        });
                    }
                    let effective = if lt.is_numeric() && rt.is_numeric() {
                        lt.promote(rt)
                    } else {
                        lt
                    };
                    if !effective.supports_ordering() {
                        return Err(FilterError::Type {
                            message: format!(
                                "Cannot use '{}' with {}",
                                op.as_str(),
                                effective.as_str()
                            ),
                            expected: "Edm.Int32, Edm.Int64, Edm.Double, Edm.DateTime".to_string(),
                            actual: effective.as_str().to_string(),
                            position: Some(position),
                        });
                    }
                }
            }
            return Ok(Some(EdmType::Boolean));
        }

        // Arithmetic
        for side in [left, right].into_iter().flatten() {
            if !side.is_numeric() && side != EdmType::Null {
                return Err(type_error(
                    &format!(
                        "Cannot use arithmetic operator '{}' with {}",
                        op.as_str(),
                        side.as_str()
                    ),
                    EdmType::Double,
                    side,
                    position,
                ));
            }
        }
        match (left, right) {
            (Some(lt), Some(rt)) if lt.is_numeric() && rt.is_numeric() => {
                Ok(Some(lt.promote(rt)))
            }
            _ => Ok(None),
        }
    }
}

fn type_error(message: &str, expected: EdmType, actual: EdmType, position: SourcePosition) -> FilterError {
    FilterError::Type {
        message: message.to_string(),
        expected: expected.as_str().to_string(),
        actual: actual.as_str().to_string(),
        position: Some(position),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;

    #[test]
    fn test_promotion_hierarchy() {
        assert_eq!(EdmType::Int32.promote(EdmType::Int64), EdmType::Int64);
        assert_eq!(EdmType::Int64.promote(EdmType::Double), EdmType::Double);
        assert_eq!(EdmType::Int32.promote(EdmType::Int32), EdmType::Int32);
    }

    #[test]
    fn test_comparability() {
        assert!(EdmType::Int32.is_comparable(EdmType::Double));
        assert!(EdmType::Null.is_comparable(EdmType::String));
        assert!(!EdmType::String.is_comparable(EdmType::Int32));
    }

    #[test]
    fn test_int_classification() {
        assert_eq!(Value::from_int(5).edm_type(), EdmType::Int32);
        assert_eq!(Value::from_int(5_000_000_000).edm_type(), EdmType::Int64);
    }

    #[test]
    fn test_checker_rejects_literal_mismatch() {
        assert!(matches!(
            compile("1 gt 'a'"),
            Err(FilterError::Type { .. })
        ));
    }

    #[test]
    fn test_checker_rejects_null_ordering() {
        assert!(matches!(
            compile("Price gt null"),
            Err(FilterError::Type { .. })
        ));
    }

    #[test]
    fn test_checker_defers_property_types() {
        // Property types are unknown statically, so this passes checking.
        assert!(compile("Price gt 50 and Name eq 'x'").is_ok());
    }

    #[test]
    fn test_checker_rejects_negating_strings() {
        assert!(matches!(
            compile("-'a' gt 1"),
            Err(FilterError::Type { .. })
        ));
    }

    #[test]
    fn test_checker_allows_negating_numerics() {
        assert!(compile("-Price gt -10").is_ok());
        assert!(compile("-(1 add 2) eq -3").is_ok());
    }
}
