//! OData function library
//!
//! Null arguments propagate to null results for every value-returning
//! function (three-valued logic). Comparison functions are case-insensitive
//! (`startswith`, `endswith`, `contains`, `substringof`); `indexof` and
//! `replace` are case-sensitive, matching the storage service they emulate.

use crate::types::{EdmType, Value};
use chrono::{Datelike, Timelike};
use localbus_core::{FilterError, SourcePosition};

/// All reserved function names, used for lookups and suggestions.
pub const FUNCTION_NAMES: &[&str] = &[
    "startswith",
    "endswith",
    "contains",
    "substringof",
    "tolower",
    "toupper",
    "trim",
    "concat",
    "substring",
    "length",
    "indexof",
    "replace",
    "year",
    "month",
    "day",
    "hour",
    "minute",
    "second",
    "round",
    "floor",
    "ceiling",
    "isof",
    "cast",
];

/// Registry of OData functions: signature checks at compile time, dispatch
/// at evaluation time.
///
/// The registry is read-only after construction and may be shared across
/// evaluations.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry;

impl FunctionRegistry {
    pub fn new() -> Self {
        Self
    }

    /// List all registered function names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = FUNCTION_NAMES.to_vec();
        names.sort_unstable();
        names
    }

    /// Suggest the registered name closest to a misspelled one.
    pub fn suggest(&self, name: &str) -> Option<String> {
        FUNCTION_NAMES
            .iter()
            .map(|candidate| (edit_distance(name, candidate), *candidate))
            .filter(|(distance, _)| *distance <= 2)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, candidate)| format!("Did you mean '{}'?", candidate))
    }

    /// Static signature check used by the type checker. `None` argument
    /// types mark property-dependent values that are compatible with
    /// anything.
    pub fn check_call(
        &self,
        name: &str,
        args: &[Option<EdmType>],
        position: SourcePosition,
    ) -> Result<Option<EdmType>, FilterError> {
        let arity_error = |expected: &str| FilterError::Type {
            message: format!(
                "Function '{}' expects {} argument(s), got {}",
                name,
                expected,
                args.len()
            ),
            expected: expected.to_string(),
            actual: args.len().to_string(),
            position: Some(position),
        };

        let check_arg = |index: usize, expected: EdmType| -> Result<(), FilterError> {
            if let Some(Some(actual)) = args.get(index) {
                let actual = *actual;
                if actual == EdmType::Null {
                    return Ok(());
                }
                if expected.is_numeric() && actual.is_numeric() {
                    return Ok(());
                }
                if actual != expected {
                    return Err(FilterError::Type {
                        message: format!(
                            "Function '{}' argument {}: expected {}, got {}",
                            name,
                            index + 1,
                            expected.as_str(),
                            actual.as_str()
                        ),
                        expected: expected.as_str().to_string(),
                        actual: actual.as_str().to_string(),
                        position: Some(position),
                    });
                }
            }
            Ok(())
        };

        match name {
            "startswith" | "endswith" | "contains" | "substringof" => {
                if args.len() != 2 {
                    return Err(arity_error("2"));
                }
                check_arg(0, EdmType::String)?;
                check_arg(1, EdmType::String)?;
                Ok(Some(EdmType::Boolean))
            }
            "tolower" | "toupper" | "trim" => {
                if args.len() != 1 {
                    return Err(arity_error("1"));
                }
                check_arg(0, EdmType::String)?;
                Ok(Some(EdmType::String))
            }
            "concat" => {
                if args.len() != 2 {
                    return Err(arity_error("2"));
                }
                check_arg(0, EdmType::String)?;
                check_arg(1, EdmType::String)?;
                Ok(Some(EdmType::String))
            }
            "substring" => {
                // Two overloads: (string, start) and (string, start, length).
                if args.len() != 2 && args.len() != 3 {
                    return Err(arity_error("2 or 3"));
                }
                check_arg(0, EdmType::String)?;
                check_arg(1, EdmType::Int32)?;
                if args.len() == 3 {
                    check_arg(2, EdmType::Int32)?;
                }
                Ok(Some(EdmType::String))
            }
            "length" => {
                if args.len() != 1 {
                    return Err(arity_error("1"));
                }
                check_arg(0, EdmType::String)?;
                Ok(Some(EdmType::Int32))
            }
            "indexof" => {
                if args.len() != 2 {
                    return Err(arity_error("2"));
                }
                check_arg(0, EdmType::String)?;
                check_arg(1, EdmType::String)?;
                Ok(Some(EdmType::Int32))
            }
            "replace" => {
                if args.len() != 3 {
                    return Err(arity_error("3"));
                }
                for i in 0..3 {
                    check_arg(i, EdmType::String)?;
                }
                Ok(Some(EdmType::String))
            }
            "year" | "month" | "day" | "hour" | "minute" | "second" => {
                if args.len() != 1 {
                    return Err(arity_error("1"));
                }
                check_arg(0, EdmType::DateTime)?;
                Ok(Some(EdmType::Int32))
            }
            "round" | "floor" | "ceiling" => {
                if args.len() != 1 {
                    return Err(arity_error("1"));
                }
                check_arg(0, EdmType::Double)?;
                Ok(Some(EdmType::Double))
            }
            "isof" => {
                if args.len() != 2 {
                    return Err(arity_error("2"));
                }
                check_arg(1, EdmType::String)?;
                Ok(Some(EdmType::Boolean))
            }
            "cast" => {
                if args.len() != 2 {
                    return Err(arity_error("2"));
                }
                check_arg(1, EdmType::String)?;
                // Target type depends on the type-name argument's value.
                Ok(None)
            }
            _ => Err(FilterError::UnknownFunction {
                name: name.to_string(),
                suggestion: self.suggest(name),
            }),
        }
    }

    /// Call a function with evaluated arguments.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, FilterError> {
        match name {
            "startswith" => string_predicate(name, args, |s, p| s.starts_with(p)),
            "endswith" => string_predicate(name, args, |s, p| s.ends_with(p)),
            "contains" => string_predicate(name, args, |s, p| s.contains(p)),
            // OData v3 form with reversed argument order.
            "substringof" => string_predicate(name, args, |p, s| s.contains(p)),
            "tolower" => string_map(name, args, |s| s.to_lowercase()),
            "toupper" => string_map(name, args, |s| s.to_uppercase()),
            "trim" => string_map(name, args, |s| s.trim().to_string()),
            "concat" => {
                let (a, b) = two(name, args)?;
                if a.is_null() || b.is_null() {
                    return Ok(Value::Null);
                }
                let a = want_string(name, a)?;
                let b = want_string(name, b)?;
                Ok(Value::String(format!("{}{}", a, b)))
            }
            "substring" => substring(args),
            "length" => {
                let s = one(name, args)?;
                if s.is_null() {
                    return Ok(Value::Null);
                }
                let s = want_string(name, s)?;
                Ok(Value::Int32(s.chars().count() as i32))
            }
            "indexof" => {
                let (s, sub) = two(name, args)?;
                if s.is_null() || sub.is_null() {
                    return Ok(Value::Null);
                }
                let s = want_string(name, s)?;
                let sub = want_string(name, sub)?;
                // Case-sensitive, char-indexed.
                match s.find(sub) {
                    Some(byte_index) => Ok(Value::Int32(s[..byte_index].chars().count() as i32)),
                    None => Ok(Value::Int32(-1)),
                }
            }
            "replace" => {
                let (s, find, with) = three(name, args)?;
                if s.is_null() || find.is_null() || with.is_null() {
                    return Ok(Value::Null);
                }
                let s = want_string(name, s)?;
                let find = want_string(name, find)?;
                let with = want_string(name, with)?;
                Ok(Value::String(s.replace(find, with)))
            }
            "year" => date_part(name, args, |dt| dt.year()),
            "month" => date_part(name, args, |dt| dt.month() as i32),
            "day" => date_part(name, args, |dt| dt.day() as i32),
            "hour" => date_part(name, args, |dt| dt.hour() as i32),
            "minute" => date_part(name, args, |dt| dt.minute() as i32),
            "second" => date_part(name, args, |dt| dt.second() as i32),
            "round" => math_map(name, args, |n| n.round()),
            "floor" => math_map(name, args, |n| n.floor()),
            "ceiling" => math_map(name, args, |n| n.ceil()),
            "isof" => isof(name, args),
            "cast" => cast(name, args),
            _ => Err(FilterError::UnknownFunction {
                name: name.to_string(),
                suggestion: self.suggest(name),
            }),
        }
    }
}

// ============================================================================
// IMPLEMENTATION HELPERS
// ============================================================================

fn one<'a>(name: &str, args: &'a [Value]) -> Result<&'a Value, FilterError> {
    match args {
        [a] => Ok(a),
        _ => Err(bad_arity(name, "1", args.len())),
    }
}

fn two<'a>(name: &str, args: &'a [Value]) -> Result<(&'a Value, &'a Value), FilterError> {
    match args {
        [a, b] => Ok((a, b)),
        _ => Err(bad_arity(name, "2", args.len())),
    }
}

fn three<'a>(
    name: &str,
    args: &'a [Value],
) -> Result<(&'a Value, &'a Value, &'a Value), FilterError> {
    match args {
        [a, b, c] => Ok((a, b, c)),
        _ => Err(bad_arity(name, "3", args.len())),
    }
}

fn bad_arity(name: &str, expected: &str, got: usize) -> FilterError {
    FilterError::Evaluation {
        message: format!(
            "Function '{}' expects {} argument(s), got {}",
            name, expected, got
        ),
    }
}

fn want_string<'a>(name: &str, value: &'a Value) -> Result<&'a str, FilterError> {
    value.as_str().ok_or_else(|| FilterError::Evaluation {
        message: format!(
            "Function '{}' expects a string, got {}",
            name,
            value.edm_type().as_str()
        ),
    })
}

fn want_number(name: &str, value: &Value) -> Result<f64, FilterError> {
    value.as_f64().ok_or_else(|| FilterError::Evaluation {
        message: format!(
            "Function '{}' expects a numeric value, got {}",
            name,
            value.edm_type().as_str()
        ),
    })
}

/// Case-insensitive two-string predicate with null propagation.
fn string_predicate(
    name: &str,
    args: &[Value],
    test: impl Fn(&str, &str) -> bool,
) -> Result<Value, FilterError> {
    let (a, b) = two(name, args)?;
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    let a = want_string(name, a)?.to_lowercase();
    let b = want_string(name, b)?.to_lowercase();
    Ok(Value::Bool(test(&a, &b)))
}

fn string_map(
    name: &str,
    args: &[Value],
    map: impl Fn(&str) -> String,
) -> Result<Value, FilterError> {
    let s = one(name, args)?;
    if s.is_null() {
        return Ok(Value::Null);
    }
    Ok(Value::String(map(want_string(name, s)?)))
}

fn date_part(
    name: &str,
    args: &[Value],
    part: impl Fn(&chrono::DateTime<chrono::Utc>) -> i32,
) -> Result<Value, FilterError> {
    let v = one(name, args)?;
    match v {
        Value::Null => Ok(Value::Null),
        Value::DateTime(dt) => Ok(Value::Int32(part(dt))),
        other => Err(FilterError::Evaluation {
            message: format!(
                "Function '{}' expects a datetime, got {}",
                name,
                other.edm_type().as_str()
            ),
        }),
    }
}

fn math_map(name: &str, args: &[Value], map: impl Fn(f64) -> f64) -> Result<Value, FilterError> {
    let v = one(name, args)?;
    if v.is_null() {
        return Ok(Value::Null);
    }
    Ok(Value::Double(map(want_number(name, v)?)))
}

/// substring(s, start) / substring(s, start, length). 0-indexed; negative
/// start or length clamps to 0; length past the end clips.
fn substring(args: &[Value]) -> Result<Value, FilterError> {
    if args.len() != 2 && args.len() != 3 {
        return Err(bad_arity("substring", "2 or 3", args.len()));
    }
    if args.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }

    let s = want_string("substring", &args[0])?;
    let start = want_number("substring", &args[1])? as i64;
    let start = start.max(0) as usize;

    let result: String = if args.len() == 2 {
        s.chars().skip(start).collect()
    } else {
        let length = want_number("substring", &args[2])? as i64;
        let length = length.max(0) as usize;
        s.chars().skip(start).take(length).collect()
    };

    Ok(Value::String(result))
}

fn isof(name: &str, args: &[Value]) -> Result<Value, FilterError> {
    let (value, type_name) = two(name, args)?;
    let type_name = want_string(name, type_name)?;
    let target = match EdmType::from_name(type_name) {
        Some(t) => t,
        None => return Ok(Value::Bool(false)),
    };

    let matches = match target {
        EdmType::Null => value.is_null(),
        // Any numeric classifies as a Double per the storage emulation rules.
        EdmType::Double => value.edm_type().is_numeric(),
        EdmType::Int32 | EdmType::Int64 => {
            matches!(value, Value::Int32(_) | Value::Int64(_))
        }
        other => value.edm_type() == other,
    };

    Ok(Value::Bool(matches))
}

fn cast(name: &str, args: &[Value]) -> Result<Value, FilterError> {
    let (value, type_name) = two(name, args)?;
    if value.is_null() {
        return Ok(Value::Null);
    }
    let type_name = want_string(name, type_name)?;

    let cannot = |reason: &str| FilterError::Evaluation {
        message: format!("Cannot cast {} to {}: {}", value, type_name, reason),
    };

    match type_name {
        "Edm.String" => Ok(Value::String(plain_string(value))),
        "Edm.Int32" => cast_integer(value).map(|n| {
            i32::try_from(n)
                .map(Value::Int32)
                .unwrap_or(Value::Int64(n))
        }),
        "Edm.Int64" => cast_integer(value).map(Value::Int64),
        "Edm.Double" => match value {
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|_| cannot("not a number")),
            other => want_number(name, other).map(Value::Double),
        },
        "Edm.Boolean" => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::String(s) => {
                let lowered = s.to_lowercase();
                Ok(Value::Bool(matches!(
                    lowered.as_str(),
                    "true" | "1" | "yes"
                )))
            }
            other => match other.as_f64() {
                Some(n) => Ok(Value::Bool(n != 0.0)),
                None => Err(cannot("no boolean conversion")),
            },
        },
        _ => Err(cannot("unsupported target type")),
    }
}

fn cast_integer(value: &Value) -> Result<i64, FilterError> {
    match value {
        Value::Int32(n) => Ok(*n as i64),
        Value::Int64(n) => Ok(*n),
        Value::Double(f) => Ok(*f as i64),
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| FilterError::Evaluation {
            message: format!("Cannot cast '{}' to an integer", s),
        }),
        Value::Bool(b) => Ok(*b as i64),
        other => Err(FilterError::Evaluation {
            message: format!("Cannot cast {} to an integer", other.edm_type().as_str()),
        }),
    }
}

fn plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Int32(n) => n.to_string(),
        Value::Int64(n) => n.to_string(),
        Value::Double(n) => n.to_string(),
        Value::DateTime(dt) => dt.to_rfc3339(),
        Value::Guid(g) => g.to_string(),
        Value::Binary(_) | Value::Null => String::new(),
    }
}

/// Classic dynamic-programming edit distance, used only for suggestions.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }

    prev[b.len()]
}
