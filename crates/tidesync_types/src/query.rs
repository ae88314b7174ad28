//! Queries and the minimal comparison predicate model.
//!
//! Full predicate construction belongs to the embedding SDK; the engine only
//! needs enough structure to append its own `__updatedAt` high-water clause
//! and to let local/in-memory stores evaluate filters.

use crate::item::Item;
use crate::time::Timestamp;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Sort direction for an ordering clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Comparison operator for a field predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

/// A filter over items.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every item.
    True,
    /// Compares one field against a constant.
    Compare {
        /// Field name.
        field: String,
        /// Comparison operator.
        op: CompareOp,
        /// Constant to compare against.
        value: Value,
    },
    /// Both sides must match.
    And(Box<Predicate>, Box<Predicate>),
    /// Either side must match.
    Or(Box<Predicate>, Box<Predicate>),
    /// Inverts the inner predicate.
    Not(Box<Predicate>),
}

impl Predicate {
    /// Builds a field comparison.
    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Builds an equality comparison.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    /// Builds a greater-or-equal comparison.
    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ge, value)
    }

    /// Conjoins this predicate with another; `True` operands collapse away.
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::True, p) | (p, Predicate::True) => p,
            (a, b) => Predicate::And(Box::new(a), Box::new(b)),
        }
    }

    /// Returns true for the trivial match-all predicate.
    #[must_use]
    pub fn is_trivial(&self) -> bool {
        matches!(self, Predicate::True)
    }

    /// Evaluates the predicate against an item.
    ///
    /// A comparison whose field is absent or whose operands are incomparable
    /// matches only under `Ne`.
    #[must_use]
    pub fn matches(&self, item: &Item) -> bool {
        match self {
            Predicate::True => true,
            Predicate::Compare { field, op, value } => {
                let ordering = item.get(field).and_then(|found| compare_values(found, value));
                match (ordering, op) {
                    (None, CompareOp::Ne) => true,
                    (None, _) => false,
                    (Some(ord), op) => match op {
                        CompareOp::Eq => ord == Ordering::Equal,
                        CompareOp::Ne => ord != Ordering::Equal,
                        CompareOp::Lt => ord == Ordering::Less,
                        CompareOp::Le => ord != Ordering::Greater,
                        CompareOp::Gt => ord == Ordering::Greater,
                        CompareOp::Ge => ord != Ordering::Less,
                    },
                }
            }
            Predicate::And(a, b) => a.matches(item) && b.matches(item),
            Predicate::Or(a, b) => a.matches(item) || b.matches(item),
            Predicate::Not(inner) => !inner.matches(item),
        }
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Predicate::True
    }
}

/// Compares two JSON values.
///
/// Strings that both parse as ISO-8601 timestamps compare as instants, so a
/// `__updatedAt >= token` clause behaves identically across precision and
/// offset variations. Values of different JSON kinds are incomparable.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => {
            match (Timestamp::parse(x), Timestamp::parse(y)) {
                (Ok(tx), Ok(ty)) => Some(tx.cmp(&ty)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// A read against one logical table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Target table name (case-sensitive).
    pub table: String,
    /// Row filter.
    pub predicate: Predicate,
    /// Ordering clauses, applied left to right.
    pub order_by: Vec<(String, SortDirection)>,
    /// Projection; empty means all fields.
    pub select_fields: Vec<String>,
    /// Whether the data source should report the unpaged row count.
    pub include_total_count: bool,
    /// Rows to skip.
    pub fetch_offset: usize,
    /// Maximum rows to return; `None` means no limit.
    pub fetch_limit: Option<usize>,
    /// Extra wire parameters.
    pub parameters: BTreeMap<String, String>,
}

impl Query {
    /// Creates a match-all query for a table.
    pub fn for_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            predicate: Predicate::True,
            order_by: Vec::new(),
            select_fields: Vec::new(),
            include_total_count: false,
            fetch_offset: 0,
            fetch_limit: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Sets the row filter.
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Appends an ordering clause.
    #[must_use]
    pub fn with_order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push((field.into(), direction));
        self
    }

    /// Sets the projection.
    #[must_use]
    pub fn with_select_fields(mut self, fields: Vec<String>) -> Self {
        self.select_fields = fields;
        self
    }

    /// Requests the unpaged row count.
    #[must_use]
    pub fn with_total_count(mut self, include: bool) -> Self {
        self.include_total_count = include;
        self
    }

    /// Sets the fetch offset.
    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.fetch_offset = offset;
        self
    }

    /// Sets the fetch limit.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.fetch_limit = Some(limit);
        self
    }

    /// Adds a wire parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Validates a pull stream identifier.
///
/// Grammar: `^[A-Za-z][A-Za-z0-9_-]{0,24}$`.
#[must_use]
pub fn is_valid_query_id(query_id: &str) -> bool {
    let mut chars = query_id.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphabetic() {
        return false;
    }
    if query_id.len() > 25 {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
