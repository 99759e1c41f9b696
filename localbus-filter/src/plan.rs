//! Query optimizer and plan cache
//!
//! Classifies a filter AST into one of four plan shapes by pattern-matching
//! equality and range constraints on the distinguished `PartitionKey` /
//! `RowKey` properties, produces a residual filter with the extracted
//! constraints removed, and caches plans in a bounded LRU keyed by a stable
//! hash of the AST text plus the projected columns.

use crate::parser::{BinaryOp, Expr};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const PARTITION_KEY: &str = "PartitionKey";
const ROW_KEY: &str = "RowKey";

// Base costs per plan shape; filter complexity is added on top.
const POINT_QUERY_COST: f64 = 1.0;
const PARTITION_SCAN_COST: f64 = 10.0;
const RANGE_QUERY_COST: f64 = 15.0;
const TABLE_SCAN_COST: f64 = 100.0;

// ============================================================================
// PLANS
// ============================================================================

/// An execution plan for a filter over a keyed property-map store, ordered
/// best to worst.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// `PartitionKey eq X and RowKey eq Y`: single-entity lookup.
    Point {
        partition_key: String,
        row_key: String,
        residual: Option<Expr>,
        estimated_cost: f64,
    },
    /// Partition equality plus at least one RowKey bound.
    Range {
        partition_key: String,
        row_key_start: Option<String>,
        row_key_end: Option<String>,
        start_inclusive: bool,
        end_inclusive: bool,
        residual: Option<Expr>,
        estimated_cost: f64,
    },
    /// Partition equality only.
    PartitionScan {
        partition_key: String,
        residual: Option<Expr>,
        estimated_cost: f64,
    },
    /// Everything else, including any `or`/`not` at the key path.
    TableScan {
        residual: Option<Expr>,
        estimated_cost: f64,
    },
}

impl QueryPlan {
    pub fn estimated_cost(&self) -> f64 {
        match self {
            QueryPlan::Point { estimated_cost, .. }
            | QueryPlan::Range { estimated_cost, .. }
            | QueryPlan::PartitionScan { estimated_cost, .. }
            | QueryPlan::TableScan { estimated_cost, .. } => *estimated_cost,
        }
    }

    /// The filter left to apply after the planned lookup.
    pub fn residual(&self) -> Option<&Expr> {
        match self {
            QueryPlan::Point { residual, .. }
            | QueryPlan::Range { residual, .. }
            | QueryPlan::PartitionScan { residual, .. }
            | QueryPlan::TableScan { residual, .. } => residual.as_ref(),
        }
    }

    pub fn shape_name(&self) -> &'static str {
        match self {
            QueryPlan::Point { .. } => "point_query",
            QueryPlan::Range { .. } => "range_query",
            QueryPlan::PartitionScan { .. } => "partition_scan",
            QueryPlan::TableScan { .. } => "table_scan",
        }
    }
}

// ============================================================================
// KEY EXTRACTION
// ============================================================================

/// Equality and range constraints found on the distinguished keys.
#[derive(Debug, Default)]
struct KeyConstraints {
    partition_key: Option<String>,
    row_key: Option<String>,
    row_key_gt: Option<String>,
    row_key_ge: Option<String>,
    row_key_lt: Option<String>,
    row_key_le: Option<String>,
    has_other_predicates: bool,
}

impl KeyConstraints {
    fn extract(expr: &Expr) -> Self {
        let mut constraints = Self::default();
        constraints.walk(expr);
        constraints
    }

    fn walk(&mut self, expr: &Expr) {
        match expr {
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
                ..
            } => {
                self.walk(left);
                self.walk(right);
            }
            Expr::Binary {
                op: BinaryOp::Eq,
                left,
                right,
                ..
            } => match key_literal(left, right) {
                Some((PARTITION_KEY, value)) => self.partition_key = Some(value),
                Some((ROW_KEY, value)) => self.row_key = Some(value),
                _ => self.has_other_predicates = true,
            },
            Expr::Binary {
                op, left, right, ..
            } if op.is_ordering() => match key_literal(left, right) {
                Some((ROW_KEY, value)) => match op {
                    BinaryOp::Gt => self.row_key_gt = Some(value),
                    BinaryOp::Ge => self.row_key_ge = Some(value),
                    BinaryOp::Lt => self.row_key_lt = Some(value),
                    BinaryOp::Le => self.row_key_le = Some(value),
                    _ => unreachable!(),
                },
                _ => self.has_other_predicates = true,
            },
            // OR, NE, NOT, and function calls at the key path prevent
            // key-based planning.
            _ => self.has_other_predicates = true,
        }
    }

    fn has_row_key_bound(&self) -> bool {
        self.row_key_gt.is_some()
            || self.row_key_ge.is_some()
            || self.row_key_lt.is_some()
            || self.row_key_le.is_some()
    }
}

/// Match `Property op Literal` where the property is one of the keys.
fn key_literal(left: &Expr, right: &Expr) -> Option<(&'static str, String)> {
    let (Expr::Property { name, .. }, Expr::Literal { value, .. }) = (left, right) else {
        return None;
    };
    let key = if name == PARTITION_KEY {
        PARTITION_KEY
    } else if name == ROW_KEY {
        ROW_KEY
    } else {
        return None;
    };
    // Key constraints compare as strings.
    let text = match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    };
    Some((key, text))
}

// ============================================================================
// FILTER SIMPLIFICATION
// ============================================================================

/// Remove key constraints that the planned lookup already applies. Removing a
/// child of an `and` collapses to the surviving side.
fn simplify(
    expr: &Expr,
    partition_key: Option<&str>,
    row_key: Option<&str>,
    remove_row_key_ranges: bool,
) -> Option<Expr> {
    match expr {
        Expr::Binary {
            op: BinaryOp::And,
            left,
            right,
            position,
        } => {
            let left = simplify(left, partition_key, row_key, remove_row_key_ranges);
            let right = simplify(right, partition_key, row_key, remove_row_key_ranges);
            match (left, right) {
                (None, None) => None,
                (Some(side), None) | (None, Some(side)) => Some(side),
                (Some(left), Some(right)) => Some(Expr::Binary {
                    op: BinaryOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                    position: *position,
                }),
            }
        }
        Expr::Binary {
            op: BinaryOp::Eq,
            left,
            right,
            ..
        } => {
            if let Some((key, value)) = key_literal(left, right) {
                if key == PARTITION_KEY && Some(value.as_str()) == partition_key {
                    return None;
                }
                if key == ROW_KEY && Some(value.as_str()) == row_key {
                    return None;
                }
            }
            Some(expr.clone())
        }
        Expr::Binary {
            op, left, right, ..
        } if remove_row_key_ranges && op.is_ordering() => {
            if matches!(key_literal(left, right), Some((ROW_KEY, _))) {
                return None;
            }
            Some(expr.clone())
        }
        other => Some(other.clone()),
    }
}

// ============================================================================
// COST MODEL
// ============================================================================

/// Filter complexity: 0.1 per comparison, 0.05 per unary, 0.2 per function
/// call, summed recursively.
fn complexity(expr: &Expr) -> f64 {
    match expr {
        Expr::Binary {
            op, left, right, ..
        } => {
            let own = if op.is_comparison() { 0.1 } else { 0.0 };
            own + complexity(left) + complexity(right)
        }
        Expr::Unary { operand, .. } => 0.05 + complexity(operand),
        Expr::Call { args, .. } => 0.2 + args.iter().map(complexity).sum::<f64>(),
        Expr::Literal { .. } | Expr::Property { .. } => 0.0,
    }
}

fn estimate(base: f64, residual: Option<&Expr>) -> f64 {
    base + residual.map(complexity).unwrap_or(0.0)
}

// ============================================================================
// OPTIMIZER
// ============================================================================

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct PlanCache {
    plans: HashMap<String, Arc<QueryPlan>>,
    order: VecDeque<String>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl PlanCache {
    fn new(capacity: usize) -> Self {
        Self {
            plans: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<QueryPlan>> {
        if let Some(plan) = self.plans.get(key) {
            self.hits += 1;
            let plan = Arc::clone(plan);
            // Refresh recency.
            if let Some(index) = self.order.iter().position(|k| k == key) {
                self.order.remove(index);
            }
            self.order.push_back(key.to_string());
            Some(plan)
        } else {
            self.misses += 1;
            None
        }
    }

    fn insert(&mut self, key: String, plan: Arc<QueryPlan>) {
        while self.plans.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.plans.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.plans.insert(key, plan);
    }
}

/// Plan generator with a bounded, mutex-guarded LRU cache.
pub struct QueryOptimizer {
    cache: Mutex<PlanCache>,
}

impl Default for QueryOptimizer {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl QueryOptimizer {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: Mutex::new(PlanCache::new(cache_capacity.max(1))),
        }
    }

    /// Plan a query for the given filter and projected columns.
    pub fn optimize(
        &self,
        filter: Option<&Expr>,
        select: Option<&[String]>,
    ) -> Arc<QueryPlan> {
        let key = cache_key(filter, select);

        if let Ok(mut cache) = self.cache.lock() {
            if let Some(plan) = cache.get(&key) {
                return plan;
            }
        }

        let plan = Arc::new(self.build_plan(filter));

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, Arc::clone(&plan));
        }

        plan
    }

    fn build_plan(&self, filter: Option<&Expr>) -> QueryPlan {
        let Some(expr) = filter else {
            return QueryPlan::TableScan {
                residual: None,
                estimated_cost: TABLE_SCAN_COST,
            };
        };

        let keys = KeyConstraints::extract(expr);

        match (&keys.partition_key, &keys.row_key) {
            (Some(partition_key), Some(row_key)) => {
                let residual = if keys.has_other_predicates {
                    simplify(expr, Some(partition_key), Some(row_key), false)
                } else {
                    None
                };
                QueryPlan::Point {
                    estimated_cost: estimate(POINT_QUERY_COST, residual.as_ref()),
                    partition_key: partition_key.clone(),
                    row_key: row_key.clone(),
                    residual,
                }
            }
            (Some(partition_key), None) if keys.has_row_key_bound() => {
                let residual = simplify(expr, Some(partition_key), None, true);
                QueryPlan::Range {
                    estimated_cost: estimate(RANGE_QUERY_COST, residual.as_ref()),
                    partition_key: partition_key.clone(),
                    row_key_start: keys.row_key_ge.clone().or(keys.row_key_gt.clone()),
                    row_key_end: keys.row_key_le.clone().or(keys.row_key_lt.clone()),
                    start_inclusive: keys.row_key_ge.is_some(),
                    end_inclusive: keys.row_key_le.is_some(),
                    residual,
                }
            }
            (Some(partition_key), None) => {
                let residual = simplify(expr, Some(partition_key), None, false);
                QueryPlan::PartitionScan {
                    estimated_cost: estimate(PARTITION_SCAN_COST, residual.as_ref()),
                    partition_key: partition_key.clone(),
                    residual,
                }
            }
            _ => QueryPlan::TableScan {
                estimated_cost: estimate(TABLE_SCAN_COST, Some(expr)),
                residual: Some(expr.clone()),
            },
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        match self.cache.lock() {
            Ok(cache) => CacheStats {
                size: cache.plans.len(),
                hits: cache.hits,
                misses: cache.misses,
            },
            Err(_) => CacheStats::default(),
        }
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            let capacity = cache.capacity;
            *cache = PlanCache::new(capacity);
        }
    }
}

/// Stable cache key: sha-256 over the canonical AST text and the sorted
/// projection list.
fn cache_key(filter: Option<&Expr>, select: Option<&[String]>) -> String {
    let filter_text = match filter {
        Some(expr) => expr.to_string(),
        None => "None".to_string(),
    };
    let select_text = match select {
        Some(columns) => {
            let mut sorted: Vec<&str> = columns.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            sorted.join(",")
        }
        None => "None".to_string(),
    };

    let mut hasher = Sha256::new();
    hasher.update(filter_text.as_bytes());
    hasher.update(b"|");
    hasher.update(select_text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile;

    fn plan(filter: &str) -> Arc<QueryPlan> {
        let ast = compile(filter).expect("filter should compile");
        QueryOptimizer::default().optimize(ast.as_ref(), None)
    }

    #[test]
    fn test_point_query_detection() {
        let plan = plan("PartitionKey eq 'P1' and RowKey eq 'R1'");
        match &*plan {
            QueryPlan::Point {
                partition_key,
                row_key,
                residual,
                estimated_cost,
            } => {
                assert_eq!(partition_key, "P1");
                assert_eq!(row_key, "R1");
                assert!(residual.is_none());
                assert_eq!(*estimated_cost, 1.0);
            }
            other => panic!("expected point query, got {}", other.shape_name()),
        }
    }

    #[test]
    fn test_point_query_keeps_residual() {
        let plan = plan("PartitionKey eq 'P1' and RowKey eq 'R1' and Price gt 10");
        match &*plan {
            QueryPlan::Point { residual, .. } => {
                let residual = residual.as_ref().expect("extra predicate survives");
                assert_eq!(residual.to_string(), "(Price gt 10)");
            }
            other => panic!("expected point query, got {}", other.shape_name()),
        }
    }

    #[test]
    fn test_partition_scan_detection() {
        let plan = plan("PartitionKey eq 'P1'");
        match &*plan {
            QueryPlan::PartitionScan {
                partition_key,
                residual,
                estimated_cost,
            } => {
                assert_eq!(partition_key, "P1");
                assert!(residual.is_none());
                assert_eq!(*estimated_cost, 10.0);
            }
            other => panic!("expected partition scan, got {}", other.shape_name()),
        }
    }

    #[test]
    fn test_range_query_detection() {
        let plan = plan("PartitionKey eq 'P1' and RowKey ge 'A' and RowKey lt 'M'");
        match &*plan {
            QueryPlan::Range {
                partition_key,
                row_key_start,
                row_key_end,
                start_inclusive,
                end_inclusive,
                residual,
                ..
            } => {
                assert_eq!(partition_key, "P1");
                assert_eq!(row_key_start.as_deref(), Some("A"));
                assert_eq!(row_key_end.as_deref(), Some("M"));
                assert!(start_inclusive);
                assert!(!end_inclusive);
                assert!(residual.is_none());
            }
            other => panic!("expected range query, got {}", other.shape_name()),
        }
    }

    #[test]
    fn test_or_forces_table_scan() {
        let plan = plan("PartitionKey eq 'P1' or PartitionKey eq 'P2'");
        assert!(matches!(&*plan, QueryPlan::TableScan { .. }));
    }

    #[test]
    fn test_table_scan_cost_includes_complexity() {
        let plan = plan("Price gt 10 and startswith(Name, 'a')");
        match &*plan {
            QueryPlan::TableScan { estimated_cost, .. } => {
                // 100 base + 0.1 comparison + 0.2 function call
                assert!((estimated_cost - 100.3).abs() < 1e-9);
            }
            other => panic!("expected table scan, got {}", other.shape_name()),
        }
    }

    #[test]
    fn test_plan_cache_hits() {
        let optimizer = QueryOptimizer::new(16);
        let ast = compile("PartitionKey eq 'P1'").expect("compiles");
        optimizer.optimize(ast.as_ref(), None);
        optimizer.optimize(ast.as_ref(), None);
        let stats = optimizer.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!(stats.hit_rate() > 0.49);
    }

    #[test]
    fn test_cache_eviction_is_bounded() {
        let optimizer = QueryOptimizer::new(2);
        for i in 0..5 {
            let ast = compile(&format!("Price eq {}", i)).expect("compiles");
            optimizer.optimize(ast.as_ref(), None);
        }
        assert!(optimizer.cache_stats().size <= 2);
    }

    #[test]
    fn test_projection_changes_cache_key() {
        let optimizer = QueryOptimizer::new(16);
        let ast = compile("PartitionKey eq 'P1'").expect("compiles");
        optimizer.optimize(ast.as_ref(), None);
        optimizer.optimize(ast.as_ref(), Some(&["Name".to_string()]));
        let stats = optimizer.cache_stats();
        assert_eq!(stats.misses, 2);
    }
}
