//! Property-Based Tests for Filter Evaluation
//!
//! Property: for any generated filter tree and property map, the compiled
//! evaluator's verdict SHALL equal a direct tri-valued reference
//! interpretation of the same tree.
//!
//! This validates:
//! - The lexer/parser round-trip through rendered source is lossless
//! - Three-valued logic (null propagation, short-circuit and/or)
//! - Case-insensitive string equality and property lookup

use localbus_filter::types::{PropertyMap, Value};
use localbus_filter::{compile, QueryEvaluator};
use proptest::prelude::*;
use std::time::Duration;

// ============================================================================
// GENERATED FILTER TREES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    fn render(self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
        }
    }
}

/// A literal limited to the shapes the generators produce.
#[derive(Debug, Clone, PartialEq)]
enum Lit {
    Null,
    Bool(bool),
    Int(i32),
    Str(String),
}

impl Lit {
    fn render(&self) -> String {
        match self {
            Lit::Null => "null".to_string(),
            Lit::Bool(b) => b.to_string(),
            Lit::Int(n) => n.to_string(),
            Lit::Str(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Lit::Null => Value::Null,
            Lit::Bool(b) => Value::Bool(*b),
            Lit::Int(n) => Value::Int32(*n),
            Lit::Str(s) => Value::String(s.clone()),
        }
    }
}

#[derive(Debug, Clone)]
enum Filter {
    Cmp {
        property: String,
        op: CmpOp,
        literal: Lit,
    },
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    fn render(&self) -> String {
        match self {
            Filter::Cmp {
                property,
                op,
                literal,
            } => format!("{} {} {}", property, op.render(), literal.render()),
            Filter::And(a, b) => format!("({}) and ({})", a.render(), b.render()),
            Filter::Or(a, b) => format!("({}) or ({})", a.render(), b.render()),
            Filter::Not(inner) => format!("not ({})", inner.render()),
        }
    }
}

// ============================================================================
// REFERENCE INTERPRETER (tri-valued)
// ============================================================================

fn reference_eval(filter: &Filter, entity: &PropertyMap) -> Option<bool> {
    match filter {
        Filter::Cmp {
            property,
            op,
            literal,
        } => reference_cmp(entity.get(property), &literal.to_value(), *op),
        Filter::And(a, b) => {
            let a = reference_eval(a, entity);
            let b = reference_eval(b, entity);
            if a == Some(false) || b == Some(false) {
                Some(false)
            } else if a == Some(true) && b == Some(true) {
                Some(true)
            } else {
                None
            }
        }
        Filter::Or(a, b) => {
            let a = reference_eval(a, entity);
            let b = reference_eval(b, entity);
            if a == Some(true) || b == Some(true) {
                Some(true)
            } else if a == Some(false) && b == Some(false) {
                Some(false)
            } else {
                None
            }
        }
        Filter::Not(inner) => reference_eval(inner, entity).map(|b| !b),
    }
}

fn reference_cmp(left: Option<&Value>, right: &Value, op: CmpOp) -> Option<bool> {
    let left = left.cloned().unwrap_or(Value::Null);

    if left.is_null() || right.is_null() {
        let both_null = left.is_null() && right.is_null();
        return match op {
            CmpOp::Eq => Some(both_null),
            CmpOp::Ne => Some(!both_null),
            _ => None,
        };
    }

    let eq = match (&left, right) {
        (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int32(a), Value::Int32(b)) => a == b,
        _ => false,
    };

    match op {
        CmpOp::Eq => Some(eq),
        CmpOp::Ne => Some(!eq),
        _ => {
            let ordering = match (&left, right) {
                (Value::Int32(a), Value::Int32(b)) => a.cmp(b),
                (Value::String(a), Value::String(b)) => a.as_str().cmp(b.as_str()),
                // Generators never order booleans.
                _ => return None,
            };
            Some(match op {
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}

// ============================================================================
// STRATEGIES
// ============================================================================

/// Typed columns keep generated comparisons well-typed: IntCol holds
/// integers, StrCol strings, BoolCol booleans, and GapCol is always missing.
const INT_COLS: &[&str] = &["IntA", "IntB"];
const STR_COLS: &[&str] = &["StrA", "StrB"];
const BOOL_COL: &str = "Flag";
const GAP_COL: &str = "Gap";

fn arb_string() -> impl Strategy<Value = String> {
    "[a-z]{0,6}"
}

fn arb_cmp() -> impl Strategy<Value = Filter> {
    let int_cmp = (
        prop::sample::select(INT_COLS),
        prop_oneof![
            Just(CmpOp::Eq),
            Just(CmpOp::Ne),
            Just(CmpOp::Gt),
            Just(CmpOp::Ge),
            Just(CmpOp::Lt),
            Just(CmpOp::Le),
        ],
        -50i32..50,
    )
        .prop_map(|(property, op, n)| Filter::Cmp {
            property: property.to_string(),
            op,
            literal: Lit::Int(n),
        });

    let str_cmp = (
        prop::sample::select(STR_COLS),
        prop_oneof![
            Just(CmpOp::Eq),
            Just(CmpOp::Ne),
            Just(CmpOp::Gt),
            Just(CmpOp::Lt),
        ],
        arb_string(),
    )
        .prop_map(|(property, op, s)| Filter::Cmp {
            property: property.to_string(),
            op,
            literal: Lit::Str(s),
        });

    let bool_cmp = (prop_oneof![Just(CmpOp::Eq), Just(CmpOp::Ne)], any::<bool>()).prop_map(
        |(op, b)| Filter::Cmp {
            property: BOOL_COL.to_string(),
            op,
            literal: Lit::Bool(b),
        },
    );

    let null_cmp = (
        prop::sample::select(vec!["IntA", "StrA", GAP_COL]),
        prop_oneof![Just(CmpOp::Eq), Just(CmpOp::Ne)],
    )
        .prop_map(|(property, op)| Filter::Cmp {
            property: property.to_string(),
            op,
            literal: Lit::Null,
        });

    prop_oneof![int_cmp, str_cmp, bool_cmp, null_cmp]
}

fn arb_filter() -> impl Strategy<Value = Filter> {
    arb_cmp().prop_recursive(3, 16, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| Filter::And(Box::new(a), Box::new(b))),
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| Filter::Or(Box::new(a), Box::new(b))),
            inner.prop_map(|a| Filter::Not(Box::new(a))),
        ]
    })
}

fn arb_entity() -> impl Strategy<Value = PropertyMap> {
    (
        -50i32..50,
        -50i32..50,
        arb_string(),
        arb_string(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(int_a, int_b, str_a, str_b, flag, include_int_a)| {
            let mut entity = PropertyMap::new();
            // IntA is sometimes absent to exercise null lookups.
            if include_int_a {
                entity.insert("IntA".to_string(), Value::Int32(int_a));
            }
            entity.insert("IntB".to_string(), Value::Int32(int_b));
            entity.insert("StrA".to_string(), Value::String(str_a));
            entity.insert("StrB".to_string(), Value::String(str_b));
            entity.insert(BOOL_COL.to_string(), Value::Bool(flag));
            entity
        })
}

proptest! {
    /// The compiled evaluator agrees with the reference interpreter, with an
    /// indeterminate (null) verdict reading as "no match".
    #[test]
    fn evaluator_matches_reference(filter in arb_filter(), entity in arb_entity()) {
        let source = filter.render();
        let ast = compile(&source)
            .unwrap_or_else(|e| panic!("generated filter failed to compile: {} ({})", source, e));
        let evaluator = QueryEvaluator::new(Duration::from_secs(5));
        let actual = evaluator
            .matches(ast.as_ref(), &entity)
            .unwrap_or_else(|e| panic!("evaluation failed: {} ({})", source, e));
        let expected = reference_eval(&filter, &entity).unwrap_or(false);
        prop_assert_eq!(actual, expected, "filter: {}", source);
    }

    /// Rendering the parsed AST and re-parsing it yields an equivalent AST.
    #[test]
    fn canonical_text_reparses(filter in arb_filter()) {
        let source = filter.render();
        let first = compile(&source).expect("generated filter compiles").expect("non-empty");
        let second = compile(&first.to_string())
            .expect("canonical text compiles")
            .expect("non-empty");
        prop_assert_eq!(first.to_string(), second.to_string());
    }
}
