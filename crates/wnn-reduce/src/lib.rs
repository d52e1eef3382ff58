#![forbid(unsafe_code)]

use wnn_dtype::DataType;
use wnn_ndarray::{
    OperandDescriptor, ShapeError, contiguous_strides, element_count, reduced_shape,
};

pub const REDUCE_REASON_CODES: [&str; 5] = [
    "reduce_shape_contract_violation",
    "reduce_invalid_input_length",
    "reduce_axis_out_of_bounds",
    "reduce_duplicate_axis",
    "reduce_unsupported_data_type",
];

/// The WebNN reduction operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    L1,
    L2,
    LogSum,
    LogSumExp,
    Max,
    Mean,
    Min,
    Product,
    Sum,
    SumSquare,
}

impl ReduceOp {
    pub const ALL: [ReduceOp; 10] = [
        Self::L1,
        Self::L2,
        Self::LogSum,
        Self::LogSumExp,
        Self::Max,
        Self::Mean,
        Self::Min,
        Self::Product,
        Self::Sum,
        Self::SumSquare,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::L1 => "reduceL1",
            Self::L2 => "reduceL2",
            Self::LogSum => "reduceLogSum",
            Self::LogSumExp => "reduceLogSumExp",
            Self::Max => "reduceMax",
            Self::Mean => "reduceMean",
            Self::Min => "reduceMin",
            Self::Product => "reduceProduct",
            Self::Sum => "reduceSum",
            Self::SumSquare => "reduceSumSquare",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name.trim())
    }

    /// Whether the operator accepts inputs of `data_type`.
    ///
    /// Values travel as `f64`, which holds integers exactly only up to 2^53,
    /// so no operator accepts `int64` or `uint64`.
    #[must_use]
    pub const fn supports(self, data_type: DataType) -> bool {
        if matches!(data_type, DataType::Int64 | DataType::Uint64) {
            return false;
        }
        match self {
            Self::L2 | Self::LogSum | Self::LogSumExp | Self::Mean => data_type.is_float(),
            Self::Max | Self::Min => true,
            Self::L1 | Self::Product | Self::Sum | Self::SumSquare => matches!(
                data_type,
                DataType::Float32 | DataType::Float16 | DataType::Int32 | DataType::Uint32
            ),
        }
    }
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Options shared by every reduction.
///
/// `axes: None` reduces over every dimension. `Some(vec![])` reduces over
/// none, so the operator degenerates to its per-element form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReduceOptions {
    pub axes: Option<Vec<u32>>,
    pub keep_dimensions: bool,
}

impl ReduceOptions {
    #[must_use]
    pub fn with_axes(axes: impl Into<Vec<u32>>) -> Self {
        Self {
            axes: Some(axes.into()),
            keep_dimensions: false,
        }
    }

    #[must_use]
    pub fn keep_dimensions(mut self, keep: bool) -> Self {
        self.keep_dimensions = keep;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    descriptor: OperandDescriptor,
    values: Vec<f64>,
}

impl Tensor {
    /// Builds a tensor, rounding every value to `data_type`.
    pub fn new(shape: Vec<usize>, values: Vec<f64>, data_type: DataType) -> Result<Self, ReduceError> {
        let descriptor = OperandDescriptor::new(data_type, shape);
        descriptor
            .check_element_count(values.len())
            .map_err(ReduceError::Shape)?;
        let values = values
            .into_iter()
            .map(|v| data_type.round_on_store(v))
            .collect();
        Ok(Self { descriptor, values })
    }

    #[must_use]
    pub fn scalar(value: f64, data_type: DataType) -> Self {
        Self {
            descriptor: OperandDescriptor::new(data_type, Vec::new()),
            values: vec![data_type.round_on_store(value)],
        }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.descriptor.shape
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.descriptor.rank()
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub const fn data_type(&self) -> DataType {
        self.descriptor.data_type
    }

    /// Natural log of the sum over the reduced axes.
    pub fn reduce_log_sum(&self, options: &ReduceOptions) -> Result<Self, ReduceError> {
        self.reduce(ReduceOp::LogSum, options)
    }

    pub fn reduce(&self, op: ReduceOp, options: &ReduceOptions) -> Result<Self, ReduceError> {
        let data_type = self.data_type();
        if !op.supports(data_type) {
            return Err(ReduceError::UnsupportedDataType { op, data_type });
        }

        let reduced = resolve_axes(self.rank(), options.axes.as_deref())?;
        let out_shape = reduced_shape(self.shape(), &reduced, options.keep_dimensions);
        let out_count = element_count(&out_shape).map_err(ReduceError::Shape)?;
        let group_len = reduced_group_len(self.shape(), &reduced)?;
        let index_map = output_index_map(self.shape(), &reduced)?;

        let raw = evaluate(op, &self.values, &index_map, out_count, group_len);
        let values = raw
            .into_iter()
            .map(|v| data_type.round_on_store(v))
            .collect();

        Ok(Self {
            descriptor: OperandDescriptor::new(data_type, out_shape),
            values,
        })
    }
}

/// Validates `axes` against `rank` and returns a per-dimension reduced flag.
pub fn resolve_axes(rank: usize, axes: Option<&[u32]>) -> Result<Vec<bool>, ReduceError> {
    let Some(axes) = axes else {
        return Ok(vec![true; rank]);
    };

    let mut reduced = vec![false; rank];
    for &axis in axes {
        let idx = usize::try_from(axis).map_err(|_| ReduceError::AxisOutOfBounds { axis, rank })?;
        let Some(slot) = reduced.get_mut(idx) else {
            return Err(ReduceError::AxisOutOfBounds { axis, rank });
        };
        if *slot {
            return Err(ReduceError::DuplicateAxis { axis });
        }
        *slot = true;
    }
    Ok(reduced)
}

/// Number of input elements folded into each output element.
pub fn reduced_element_count(shape: &[usize], options: &ReduceOptions) -> Result<usize, ReduceError> {
    let reduced = resolve_axes(shape.len(), options.axes.as_deref())?;
    reduced_group_len(shape, &reduced)
}

fn reduced_group_len(shape: &[usize], reduced: &[bool]) -> Result<usize, ReduceError> {
    let dims = shape
        .iter()
        .zip(reduced)
        .filter_map(|(&dim, &is_reduced)| is_reduced.then_some(dim))
        .collect::<Vec<_>>();
    element_count(&dims).map_err(ReduceError::Shape)
}

// For every input element (row-major), the flat index of the output element
// it folds into.
fn output_index_map(shape: &[usize], reduced: &[bool]) -> Result<Vec<usize>, ReduceError> {
    let count = element_count(shape).map_err(ReduceError::Shape)?;
    let rank = shape.len();

    // Strides of the keep-dimensions output, with reduced axes pinned so
    // stepping along them stays on the same output element.
    let kept_shape = reduced_shape(shape, reduced, true);
    let mut axis_steps = contiguous_strides(&kept_shape).map_err(ReduceError::Shape)?;
    for (step, &is_reduced) in axis_steps.iter_mut().zip(reduced) {
        if is_reduced {
            *step = 0;
        }
    }

    let mut map = Vec::with_capacity(count);
    let mut multi = vec![0usize; rank];
    let mut out_flat = 0usize;
    for _ in 0..count {
        map.push(out_flat);

        // Odometer increment; keeps out_flat in step without re-raveling.
        for axis in (0..rank).rev() {
            multi[axis] += 1;
            out_flat += axis_steps[axis];
            if multi[axis] < shape[axis] {
                break;
            }
            multi[axis] = 0;
            out_flat -= axis_steps[axis] * shape[axis];
        }
    }
    Ok(map)
}

fn fold_groups(
    values: &[f64],
    index_map: &[usize],
    out_count: usize,
    init: f64,
    fold: impl Fn(f64, f64) -> f64,
) -> Vec<f64> {
    let mut out = vec![init; out_count];
    for (&value, &out_idx) in values.iter().zip(index_map) {
        out[out_idx] = fold(out[out_idx], value);
    }
    out
}

fn nan_max(acc: f64, v: f64) -> f64 {
    if acc.is_nan() || v.is_nan() {
        f64::NAN
    } else {
        acc.max(v)
    }
}

fn nan_min(acc: f64, v: f64) -> f64 {
    if acc.is_nan() || v.is_nan() {
        f64::NAN
    } else {
        acc.min(v)
    }
}

fn evaluate(
    op: ReduceOp,
    values: &[f64],
    index_map: &[usize],
    out_count: usize,
    group_len: usize,
) -> Vec<f64> {
    let sum = |map: fn(f64) -> f64| {
        fold_groups(values, index_map, out_count, 0.0, |acc, v| acc + map(v))
    };

    match op {
        ReduceOp::Sum => sum(|v| v),
        ReduceOp::SumSquare => sum(|v| v * v),
        ReduceOp::L1 => sum(f64::abs),
        ReduceOp::L2 => sum(|v| v * v).into_iter().map(f64::sqrt).collect(),
        ReduceOp::LogSum => sum(|v| v).into_iter().map(f64::ln).collect(),
        ReduceOp::Mean => {
            let n = group_len as f64;
            sum(|v| v).into_iter().map(|s| s / n).collect()
        }
        ReduceOp::Product => fold_groups(values, index_map, out_count, 1.0, |acc, v| acc * v),
        ReduceOp::Max => fold_groups(values, index_map, out_count, f64::NEG_INFINITY, nan_max),
        ReduceOp::Min => fold_groups(values, index_map, out_count, f64::INFINITY, nan_min),
        ReduceOp::LogSumExp => {
            let maxima = fold_groups(values, index_map, out_count, f64::NEG_INFINITY, nan_max);
            let mut sums = vec![0.0f64; out_count];
            for (&value, &out_idx) in values.iter().zip(index_map) {
                let m = maxima[out_idx];
                if m.is_finite() {
                    sums[out_idx] += (value - m).exp();
                }
            }
            maxima
                .into_iter()
                .zip(sums)
                .map(|(m, s)| if m.is_finite() { m + s.ln() } else { m })
                .collect()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReduceError {
    Shape(ShapeError),
    AxisOutOfBounds { axis: u32, rank: usize },
    DuplicateAxis { axis: u32 },
    UnsupportedDataType { op: ReduceOp, data_type: DataType },
}

impl std::fmt::Display for ReduceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shape(err) => write!(f, "shape error: {err}"),
            Self::AxisOutOfBounds { axis, rank } => {
                write!(f, "axis {axis} out of bounds for rank={rank}")
            }
            Self::DuplicateAxis { axis } => write!(f, "duplicate axis {axis}"),
            Self::UnsupportedDataType { op, data_type } => {
                write!(f, "{op} does not support data type {data_type}")
            }
        }
    }
}

impl std::error::Error for ReduceError {}

impl ReduceError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Shape(ShapeError::IncompatibleElementCount { .. }) => {
                "reduce_invalid_input_length"
            }
            Self::Shape(ShapeError::Overflow) => "reduce_shape_contract_violation",
            Self::AxisOutOfBounds { .. } => "reduce_axis_out_of_bounds",
            Self::DuplicateAxis { .. } => "reduce_duplicate_axis",
            Self::UnsupportedDataType { .. } => "reduce_unsupported_data_type",
        }
    }
}
