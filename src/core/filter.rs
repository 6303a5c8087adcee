//! Row Filters - PostgREST style `column=op.value` expressions

use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::core::error::RealtimeError;

/// Parsed row filter
#[derive(Debug, Clone, PartialEq)]
pub enum RowFilter {
    /// col = val
    Eq { col: Box<str>, val: FilterValue },
    /// col != val
    Neq { col: Box<str>, val: FilterValue },
    /// col > val
    Gt { col: Box<str>, val: FilterValue },
    /// col >= val
    Gte { col: Box<str>, val: FilterValue },
    /// col < val
    Lt { col: Box<str>, val: FilterValue },
    /// col <= val
    Lte { col: Box<str>, val: FilterValue },
    /// col IN (val1, val2, ...)
    In {
        col: Box<str>,
        vals: Box<[FilterValue]>,
    },
}

/// Literal on the right-hand side of a filter
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Box<str>),
}

/// Result of filter evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EvalResult {
    Match,
    NoMatch,
    /// Column missing from the row image (e.g. DELETE with key-only pre-image)
    Unknown,
}

impl EvalResult {
    /// Unknown rows are delivered; the backend already scoped the feed.
    #[inline]
    pub fn passes(self) -> bool {
        !matches!(self, EvalResult::NoMatch)
    }
}

impl RowFilter {
    /// `user_id=eq.42` shorthand
    pub fn eq(col: &str, val: impl fmt::Display) -> Self {
        RowFilter::Eq {
            col: col.into(),
            val: FilterValue::parse(&val.to_string()),
        }
    }

    pub fn parse(s: &str) -> Result<Self, RealtimeError> {
        let (col, rest) = s
            .split_once('=')
            .ok_or_else(|| RealtimeError::invalid_filter(s, "expected <column>=<op>.<value>"))?;
        let col = col.trim();
        if col.is_empty() {
            return Err(RealtimeError::invalid_filter(s, "empty column"));
        }
        let (op, raw) = rest
            .split_once('.')
            .ok_or_else(|| RealtimeError::invalid_filter(s, "missing operator"))?;
        let col: Box<str> = col.into();

        macro_rules! cmp {
            ($variant:ident) => {
                RowFilter::$variant {
                    col,
                    val: FilterValue::parse(raw),
                }
            };
        }

        Ok(match op {
            "eq" => cmp!(Eq),
            "neq" => cmp!(Neq),
            "gt" => cmp!(Gt),
            "gte" => cmp!(Gte),
            "lt" => cmp!(Lt),
            "lte" => cmp!(Lte),
            "in" => {
                let inner = raw
                    .strip_prefix('(')
                    .and_then(|r| r.strip_suffix(')'))
                    .ok_or_else(|| RealtimeError::invalid_filter(s, "in expects (a,b,...)"))?;
                let vals: Vec<FilterValue> = inner
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(FilterValue::parse)
                    .collect();
                if vals.is_empty() {
                    return Err(RealtimeError::invalid_filter(s, "empty in list"));
                }
                RowFilter::In {
                    col,
                    vals: vals.into_boxed_slice(),
                }
            }
            other => {
                return Err(RealtimeError::invalid_filter(
                    s,
                    format!("unsupported operator '{other}'"),
                ));
            }
        })
    }

    #[inline]
    pub fn column(&self) -> &str {
        match self {
            RowFilter::Eq { col, .. }
            | RowFilter::Neq { col, .. }
            | RowFilter::Gt { col, .. }
            | RowFilter::Gte { col, .. }
            | RowFilter::Lt { col, .. }
            | RowFilter::Lte { col, .. }
            | RowFilter::In { col, .. } => col,
        }
    }

    /// Evaluate filter against a JSON row
    pub fn eval(&self, row: &Value) -> EvalResult {
        let Some(v) = row.get(self.column()) else {
            return EvalResult::Unknown;
        };
        let hit = match self {
            RowFilter::Eq { val, .. } => val.matches(v),
            RowFilter::Neq { val, .. } => !val.matches(v),
            RowFilter::Gt { val, .. } => return cmp_eval(v, val, |o| o == Ordering::Greater),
            RowFilter::Gte { val, .. } => return cmp_eval(v, val, |o| o != Ordering::Less),
            RowFilter::Lt { val, .. } => return cmp_eval(v, val, |o| o == Ordering::Less),
            RowFilter::Lte { val, .. } => return cmp_eval(v, val, |o| o != Ordering::Greater),
            RowFilter::In { vals, .. } => vals.iter().any(|fv| fv.matches(v)),
        };
        if hit {
            EvalResult::Match
        } else {
            EvalResult::NoMatch
        }
    }
}

impl FromStr for RowFilter {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RowFilter::parse(s)
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (op, val) = match self {
            RowFilter::Eq { val, .. } => ("eq", val),
            RowFilter::Neq { val, .. } => ("neq", val),
            RowFilter::Gt { val, .. } => ("gt", val),
            RowFilter::Gte { val, .. } => ("gte", val),
            RowFilter::Lt { val, .. } => ("lt", val),
            RowFilter::Lte { val, .. } => ("lte", val),
            RowFilter::In { col, vals } => {
                write!(f, "{col}=in.(")?;
                for (i, v) in vals.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{v}")?;
                }
                return f.write_str(")");
            }
        };
        write!(f, "{}={}.{}", self.column(), op, val)
    }
}

#[inline]
fn cmp_eval<F>(v: &Value, val: &FilterValue, pred: F) -> EvalResult
where
    F: FnOnce(Ordering) -> bool,
{
    match val.cmp_json(v) {
        Some(ord) if pred(ord) => EvalResult::Match,
        Some(_) => EvalResult::NoMatch,
        None => EvalResult::Unknown,
    }
}

impl FilterValue {
    /// Filter literals are untyped text; infer the narrowest type.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "null" => FilterValue::Null,
            "true" => FilterValue::Bool(true),
            "false" => FilterValue::Bool(false),
            _ => {
                if let Ok(i) = raw.parse::<i64>() {
                    FilterValue::Int(i)
                } else if let Ok(f) = raw.parse::<f64>() {
                    FilterValue::Float(f)
                } else {
                    FilterValue::Str(raw.into())
                }
            }
        }
    }

    /// Equality against a JSON value. Numeric ids may arrive as strings
    /// (bigint), so numbers also compare by their text form.
    #[inline]
    pub fn matches(&self, v: &Value) -> bool {
        match (self, v) {
            (FilterValue::Null, Value::Null) => true,
            (FilterValue::Bool(a), Value::Bool(b)) => a == b,
            (FilterValue::Int(a), Value::Number(n)) => n.as_i64() == Some(*a),
            (FilterValue::Int(a), Value::String(s)) => s.parse::<i64>().ok() == Some(*a),
            (FilterValue::Float(a), Value::Number(n)) => n.as_f64() == Some(*a),
            (FilterValue::Str(a), Value::String(b)) => a.as_ref() == b.as_str(),
            _ => false,
        }
    }

    /// Returns ordering of `v` relative to this literal
    #[inline]
    fn cmp_json(&self, v: &Value) -> Option<Ordering> {
        match (self, v) {
            (FilterValue::Int(a), Value::Number(n)) => match n.as_i64() {
                Some(b) => Some(b.cmp(a)),
                None => n.as_f64().and_then(|b| b.partial_cmp(&(*a as f64))),
            },
            (FilterValue::Float(a), Value::Number(n)) => n.as_f64().and_then(|b| b.partial_cmp(a)),
            (FilterValue::Str(a), Value::String(b)) => Some(b.as_str().cmp(a.as_ref())),
            _ => None,
        }
    }
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Null => f.write_str("null"),
            FilterValue::Bool(b) => write!(f, "{b}"),
            FilterValue::Int(i) => write!(f, "{i}"),
            FilterValue::Float(x) => write!(f, "{x}"),
            FilterValue::Str(s) => f.write_str(s),
        }
    }
}
