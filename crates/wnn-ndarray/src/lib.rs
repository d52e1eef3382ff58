#![forbid(unsafe_code)]

use wnn_dtype::DataType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    Overflow,
    IncompatibleElementCount { shape: Vec<usize>, actual: usize },
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overflow => write!(f, "size arithmetic overflow"),
            Self::IncompatibleElementCount { shape, actual } => {
                write!(f, "shape {shape:?} cannot hold {actual} elements")
            }
        }
    }
}

impl std::error::Error for ShapeError {}

pub fn element_count(shape: &[usize]) -> Result<usize, ShapeError> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        acc.checked_mul(dim).ok_or(ShapeError::Overflow)
    })
}

/// Row-major strides measured in elements.
pub fn contiguous_strides(shape: &[usize]) -> Result<Vec<usize>, ShapeError> {
    let mut strides = vec![0usize; shape.len()];
    let mut stride = 1usize;
    for (idx, &dim) in shape.iter().enumerate().rev() {
        strides[idx] = stride;
        stride = stride.checked_mul(dim).ok_or(ShapeError::Overflow)?;
    }
    Ok(strides)
}

/// Shape left after reducing the flagged axes. With `keep_dimensions` the
/// reduced axes stay in place with size 1, otherwise they are dropped.
#[must_use]
pub fn reduced_shape(shape: &[usize], reduced: &[bool], keep_dimensions: bool) -> Vec<usize> {
    debug_assert_eq!(shape.len(), reduced.len());
    if keep_dimensions {
        shape
            .iter()
            .zip(reduced)
            .map(|(&dim, &is_reduced)| if is_reduced { 1 } else { dim })
            .collect()
    } else {
        shape
            .iter()
            .zip(reduced)
            .filter_map(|(&dim, &is_reduced)| (!is_reduced).then_some(dim))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperandDescriptor {
    pub data_type: DataType,
    pub shape: Vec<usize>,
}

impl OperandDescriptor {
    #[must_use]
    pub fn new(data_type: DataType, shape: Vec<usize>) -> Self {
        Self { data_type, shape }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn element_count(&self) -> Result<usize, ShapeError> {
        element_count(&self.shape)
    }

    pub fn byte_length(&self) -> Result<usize, ShapeError> {
        self.element_count()?
            .checked_mul(self.data_type.byte_length())
            .ok_or(ShapeError::Overflow)
    }

    /// Checks that `len` values fill this descriptor exactly.
    pub fn check_element_count(&self, len: usize) -> Result<usize, ShapeError> {
        let expected = self.element_count()?;
        if expected != len {
            return Err(ShapeError::IncompatibleElementCount {
                shape: self.shape.clone(),
                actual: len,
            });
        }
        Ok(expected)
    }
}
