//! # Expressions
//!
//! Small expression trees over a record's field values, used by selections,
//! projections and join predicates.
//!
//! Field references are positional. For join predicates the record is the
//! left record followed by the right record, so a right field `i` is
//! addressed as `left_width + i`.

use std::cmp::Ordering;
use std::fmt;

use crate::layout::Value;

/// Errors raised while evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    /// Field reference past the record width.
    #[error("field {field} out of bounds (record has {width} fields)")]
    FieldOutOfBounds {
        /// Referenced field.
        field: usize,
        /// Record width.
        width: usize,
    },

    /// Operands cannot be combined.
    #[error("type error: {0}")]
    Type(String),
}

/// Read access to the fields of a record.
pub trait RecordAccess {
    /// Number of fields.
    fn width(&self) -> usize;

    /// Field at `index`.
    fn field(&self, index: usize) -> Option<&Value>;
}

impl RecordAccess for [Value] {
    fn width(&self) -> usize {
        self.len()
    }

    fn field(&self, index: usize) -> Option<&Value> {
        self.get(index)
    }
}

impl RecordAccess for Vec<Value> {
    fn width(&self) -> usize {
        self.len()
    }

    fn field(&self, index: usize) -> Option<&Value> {
        self.get(index)
    }
}

/// A left and a right record viewed as one concatenated record.
#[derive(Debug, Clone, Copy)]
pub struct JoinedRecord<'a> {
    /// Left side fields.
    pub left: &'a [Value],
    /// Right side fields.
    pub right: &'a [Value],
}

impl RecordAccess for JoinedRecord<'_> {
    fn width(&self) -> usize {
        self.left.len() + self.right.len()
    }

    fn field(&self, index: usize) -> Option<&Value> {
        if index < self.left.len() {
            self.left.get(index)
        } else {
            self.right.get(index - self.left.len())
        }
    }
}

/// Comparison and logical operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    /// Logical and.
    And,
    /// Logical or.
    Or,
    /// `=`
    Equals,
    /// `!=`
    NotEquals,
    /// `>`
    Greater,
    /// `>=`
    GreaterEquals,
    /// `<`
    Less,
    /// `<=`
    LessEquals,
    /// Numeric addition.
    Add,
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::Equals => "=",
            Self::NotEquals => "!=",
            Self::Greater => ">",
            Self::GreaterEquals => ">=",
            Self::Less => "<",
            Self::LessEquals => "<=",
            Self::Add => "+",
        })
    }
}

/// Expression tree.
///
/// ```rust
/// use slipstream_core::expression::Expression;
/// use slipstream_core::layout::Value;
///
/// // field0 > 10 AND field1 = 'a'
/// let predicate = Expression::field(0)
///     .gt(Expression::constant(Value::Int64(10)))
///     .and(Expression::field(1).eq(Expression::constant(Value::Char(b'a'))));
/// let record = vec![Value::Int32(11), Value::Char(b'a')];
/// assert!(predicate.evaluate_predicate(&record).unwrap());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Positional field reference.
    Field(usize),
    /// Literal.
    Constant(Value),
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinaryOperator,
        /// Left operand.
        left: Box<Expression>,
        /// Right operand.
        right: Box<Expression>,
    },
}

impl Expression {
    /// Field reference.
    #[must_use]
    pub fn field(index: usize) -> Self {
        Self::Field(index)
    }

    /// Literal.
    #[must_use]
    pub fn constant(value: Value) -> Self {
        Self::Constant(value)
    }

    /// Binary node.
    #[must_use]
    pub fn binary(op: BinaryOperator, left: Expression, right: Expression) -> Self {
        Self::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `self AND other`
    #[must_use]
    pub fn and(self, other: Expression) -> Self {
        Self::binary(BinaryOperator::And, self, other)
    }

    /// `self OR other`
    #[must_use]
    pub fn or(self, other: Expression) -> Self {
        Self::binary(BinaryOperator::Or, self, other)
    }

    /// `self = other`
    #[must_use]
    pub fn eq(self, other: Expression) -> Self {
        Self::binary(BinaryOperator::Equals, self, other)
    }

    /// `self != other`
    #[must_use]
    pub fn ne(self, other: Expression) -> Self {
        Self::binary(BinaryOperator::NotEquals, self, other)
    }

    /// `self > other`
    #[must_use]
    pub fn gt(self, other: Expression) -> Self {
        Self::binary(BinaryOperator::Greater, self, other)
    }

    /// `self >= other`
    #[must_use]
    pub fn ge(self, other: Expression) -> Self {
        Self::binary(BinaryOperator::GreaterEquals, self, other)
    }

    /// `self < other`
    #[must_use]
    pub fn lt(self, other: Expression) -> Self {
        Self::binary(BinaryOperator::Less, self, other)
    }

    /// `self <= other`
    #[must_use]
    pub fn le(self, other: Expression) -> Self {
        Self::binary(BinaryOperator::LessEquals, self, other)
    }

    /// `self + other`
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn add(self, other: Expression) -> Self {
        Self::binary(BinaryOperator::Add, self, other)
    }

    /// Evaluates the expression against `record`.
    ///
    /// # Errors
    ///
    /// Out-of-bounds field references and operands that cannot be combined.
    pub fn evaluate<R: RecordAccess + ?Sized>(&self, record: &R) -> Result<Value, ExpressionError> {
        match self {
            Self::Field(index) => {
                record
                    .field(*index)
                    .cloned()
                    .ok_or(ExpressionError::FieldOutOfBounds {
                        field: *index,
                        width: record.width(),
                    })
            }
            Self::Constant(value) => Ok(value.clone()),
            Self::Binary { op, left, right } => match op {
                // Logical operators short-circuit.
                BinaryOperator::And => Ok(Value::Bool(
                    left.evaluate_predicate(record)? && right.evaluate_predicate(record)?,
                )),
                BinaryOperator::Or => Ok(Value::Bool(
                    left.evaluate_predicate(record)? || right.evaluate_predicate(record)?,
                )),
                BinaryOperator::Add => {
                    let lhs = left.evaluate(record)?;
                    let rhs = right.evaluate(record)?;
                    lhs.checked_add(&rhs)
                        .ok_or_else(|| ExpressionError::Type(format!("cannot add {lhs} and {rhs}")))
                }
                BinaryOperator::Equals => compare(left, right, record, Ordering::is_eq, false),
                BinaryOperator::NotEquals => compare(left, right, record, Ordering::is_ne, true),
                BinaryOperator::Greater => compare(left, right, record, Ordering::is_gt, false),
                BinaryOperator::GreaterEquals => compare(left, right, record, Ordering::is_ge, false),
                BinaryOperator::Less => compare(left, right, record, Ordering::is_lt, false),
                BinaryOperator::LessEquals => compare(left, right, record, Ordering::is_le, false),
            },
        }
    }

    /// Evaluates the expression as a boolean.
    ///
    /// # Errors
    ///
    /// Evaluation errors, or a result that has no boolean meaning.
    pub fn evaluate_predicate<R: RecordAccess + ?Sized>(
        &self,
        record: &R,
    ) -> Result<bool, ExpressionError> {
        let value = self.evaluate(record)?;
        value
            .as_bool()
            .ok_or_else(|| ExpressionError::Type(format!("{value} is not a boolean")))
    }

    /// Calls `visit` for every node, parents before children.
    pub fn walk(&self, visit: &mut impl FnMut(&Expression)) {
        visit(self);
        if let Self::Binary { left, right, .. } = self {
            left.walk(visit);
            right.walk(visit);
        }
    }

    /// Largest field index referenced, if any.
    #[must_use]
    pub fn max_field(&self) -> Option<usize> {
        let mut max = None;
        self.walk(&mut |node| {
            if let Self::Field(index) = node {
                max = max.max(Some(*index));
            }
        });
        max
    }

    /// Splits a tree of top-level `AND`s into its conjuncts.
    #[must_use]
    pub fn conjuncts(&self) -> Vec<&Expression> {
        match self {
            Self::Binary {
                op: BinaryOperator::And,
                left,
                right,
            } => {
                let mut parts = left.conjuncts();
                parts.extend(right.conjuncts());
                parts
            }
            other => vec![other],
        }
    }
}

fn compare<R: RecordAccess + ?Sized>(
    left: &Expression,
    right: &Expression,
    record: &R,
    test: fn(Ordering) -> bool,
    unordered: bool,
) -> Result<Value, ExpressionError> {
    let lhs = left.evaluate(record)?;
    let rhs = right.evaluate(record)?;
    if lhs.as_f64().is_some_and(f64::is_nan) || rhs.as_f64().is_some_and(f64::is_nan) {
        return Ok(Value::Bool(unordered));
    }
    let ordering = lhs.compare(&rhs).ok_or_else(|| {
        ExpressionError::Type(format!(
            "cannot compare {} with {}",
            lhs.data_type(),
            rhs.data_type()
        ))
    })?;
    Ok(Value::Bool(test(ordering)))
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(index) => write!(f, "${index}"),
            Self::Constant(value) => write!(f, "{value}"),
            Self::Binary { op, left, right } => write!(f, "({left} {op} {right})"),
        }
    }
}
