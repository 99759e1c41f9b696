//! localbus Filter - OData predicate engine
//!
//! This crate provides the filter machinery behind SQL subscription rules:
//! a lexer, a recursive descent parser, the EDM type system, the function
//! library, a tree-walking evaluator with three-valued logic, and the query
//! optimizer shared with the standalone filter-query engine.
//!
//! Architecture:
//! ```text
//! Filter source ("Price gt 50 and Active eq true")
//!     ↓
//! Lexer (tokenize)
//!     ↓
//! Parser (build AST)
//!     ↓
//! TypeChecker (static EDM checks)
//!     ↓
//! QueryOptimizer (plan + residual)   QueryEvaluator (match entities)
//! ```

pub mod eval;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod plan;
pub mod types;

// Re-export key types for convenience
pub use eval::*;
pub use functions::*;
pub use lexer::*;
pub use parser::*;
pub use plan::*;
pub use types::*;

// The filter error family lives in the shared taxonomy.
pub use localbus_core::{FilterError, SourcePosition};

/// Result type alias for filter operations.
pub type FilterResult<T> = Result<T, FilterError>;

/// Compile a filter expression: tokenize, parse, and type-check.
///
/// Empty input yields `Ok(None)`, a filter that matches everything.
pub fn compile(expression: &str) -> FilterResult<Option<Expr>> {
    let tokens = Lexer::new(expression).tokenize()?;
    let ast = Parser::new(tokens).parse()?;
    if let Some(expr) = &ast {
        let registry = FunctionRegistry::new();
        TypeChecker::new(&registry).check(expr)?;
    }
    Ok(ast)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_empty_matches_everything() {
        assert!(compile("").expect("empty filter is valid").is_none());
        assert!(compile("   ").expect("blank filter is valid").is_none());
    }

    #[test]
    fn test_compile_surfaces_unknown_function() {
        let err = compile("startwith(Name, 'a')").unwrap_err();
        // An unreserved name lexes as an identifier, so this surfaces as a
        // syntax error at the open parenthesis.
        assert!(matches!(err, FilterError::Syntax { .. }));
    }

    #[test]
    fn test_compile_checks_types() {
        assert!(matches!(
            compile("'a' add 1"),
            Err(FilterError::Type { .. })
        ));
    }
}
