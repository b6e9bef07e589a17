//! Physical operators of interpreted pipelines.

use crate::expression::Expression;
use crate::layout::LayoutRef;
use crate::window::JoinSide;

/// One step of an interpreted pipeline.
///
/// A pipeline starts with [`Scan`](Self::Scan), applies any number of
/// selections and projections, and ends with exactly one sink operator:
/// [`Emit`](Self::Emit), [`AggregationBuild`](Self::AggregationBuild) or
/// [`JoinBuild`](Self::JoinBuild).
#[derive(Debug, Clone)]
pub enum PhysicalOperator {
    /// Reads records of the input buffer.
    Scan {
        /// Layout of input buffers.
        layout: LayoutRef,
    },
    /// Keeps records satisfying the predicate.
    Selection {
        /// Boolean expression over the current record.
        predicate: Expression,
    },
    /// Replaces each record by the values of `expressions`.
    Projection {
        /// One expression per output field.
        expressions: Vec<Expression>,
    },
    /// Feeds records into a window aggregation and triggers it with the
    /// buffer's watermark.
    AggregationBuild {
        /// Index of the `AggregationOperatorHandler` in the context.
        handler: usize,
    },
    /// Feeds records into one side of a window join and triggers it with the
    /// buffer's watermark.
    JoinBuild {
        /// Index of the `JoinOperatorHandler` in the context.
        handler: usize,
        /// Input side.
        side: JoinSide,
    },
    /// Writes records into a result buffer carrying the input's ordering
    /// metadata.
    Emit {
        /// Layout of result buffers.
        layout: LayoutRef,
    },
}

impl PhysicalOperator {
    /// Operator name for logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scan { .. } => "scan",
            Self::Selection { .. } => "selection",
            Self::Projection { .. } => "projection",
            Self::AggregationBuild { .. } => "aggregation-build",
            Self::JoinBuild { .. } => "join-build",
            Self::Emit { .. } => "emit",
        }
    }

    /// True for operators that end a pipeline.
    #[must_use]
    pub fn is_sink(&self) -> bool {
        matches!(
            self,
            Self::AggregationBuild { .. } | Self::JoinBuild { .. } | Self::Emit { .. }
        )
    }
}
