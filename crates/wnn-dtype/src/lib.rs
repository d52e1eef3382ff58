#![forbid(unsafe_code)]

use half::f16;

/// Operand data types understood by the WebNN reduction operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Float32,
    Float16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Int8,
    Uint8,
}

impl DataType {
    pub const ALL: [DataType; 8] = [
        Self::Float32,
        Self::Float16,
        Self::Int32,
        Self::Uint32,
        Self::Int64,
        Self::Uint64,
        Self::Int8,
        Self::Uint8,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
            Self::Int64 => "int64",
            Self::Uint64 => "uint64",
            Self::Int8 => "int8",
            Self::Uint8 => "uint8",
        }
    }

    #[must_use]
    pub const fn byte_length(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Float16 => 2,
            Self::Float32 | Self::Int32 | Self::Uint32 => 4,
            Self::Int64 | Self::Uint64 => 8,
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "float32" | "f32" => Some(Self::Float32),
            "float16" | "f16" => Some(Self::Float16),
            "int32" | "i32" => Some(Self::Int32),
            "uint32" | "u32" => Some(Self::Uint32),
            "int64" | "i64" => Some(Self::Int64),
            "uint64" | "u64" => Some(Self::Uint64),
            "int8" | "i8" => Some(Self::Int8),
            "uint8" | "u8" => Some(Self::Uint8),
            _ => None,
        }
    }

    /// Returns `true` for IEEE floating-point types.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float16)
    }

    /// Rounds a value computed in `f64` to the nearest value this type can
    /// hold. Integer types truncate toward zero and saturate; NaN stores as 0.
    #[must_use]
    pub fn round_on_store(self, value: f64) -> f64 {
        match self {
            Self::Float32 => f64::from(value as f32),
            Self::Float16 => f16::from_f64(value).to_f64(),
            Self::Int32 => f64::from(value as i32),
            Self::Uint32 => f64::from(value as u32),
            Self::Int64 => value as i64 as f64,
            Self::Uint64 => value as u64 as f64,
            Self::Int8 => f64::from(value as i8),
            Self::Uint8 => f64::from(value as u8),
        }
    }

    /// Distance between two values in representable steps of this type.
    ///
    /// Both values are rounded to the type first. Two NaNs are 0 apart, a NaN
    /// against a number is `u64::MAX` apart, and signed zeros compare equal.
    #[must_use]
    pub fn ulp_distance(self, expected: f64, actual: f64) -> u64 {
        if expected.is_nan() || actual.is_nan() {
            return if expected.is_nan() && actual.is_nan() {
                0
            } else {
                u64::MAX
            };
        }

        match self {
            Self::Float32 => ordered_f32(expected as f32).abs_diff(ordered_f32(actual as f32)),
            Self::Float16 => {
                ordered_f16(f16::from_f64(expected)).abs_diff(ordered_f16(f16::from_f64(actual)))
            }
            _ => {
                let diff = (self.round_on_store(expected) - self.round_on_store(actual)).abs();
                diff as u64
            }
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// Maps the sign-magnitude bit pattern onto a monotonic integer line so that
// adjacent floats differ by one and both zeros land on 0.
fn ordered_f32(value: f32) -> i64 {
    let bits = value.to_bits();
    let magnitude = i64::from(bits & 0x7fff_ffff);
    if bits & 0x8000_0000 == 0 {
        magnitude
    } else {
        -magnitude
    }
}

fn ordered_f16(value: f16) -> i64 {
    let bits = value.to_bits();
    let magnitude = i64::from(bits & 0x7fff);
    if bits & 0x8000 == 0 {
        magnitude
    } else {
        -magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::DataType;

    #[test]
    fn parse_accepts_webnn_names_and_aliases() {
        for dtype in DataType::ALL {
            assert_eq!(DataType::parse(dtype.name()), Some(dtype));
        }
        assert_eq!(DataType::parse("f32"), Some(DataType::Float32));
        assert_eq!(DataType::parse(" float16 "), Some(DataType::Float16));
        assert_eq!(DataType::parse("bfloat16"), None);
    }

    #[test]
    fn byte_lengths_match_storage_width() {
        assert_eq!(DataType::Float16.byte_length(), 2);
        assert_eq!(DataType::Float32.byte_length(), 4);
        assert_eq!(DataType::Uint64.byte_length(), 8);
        assert_eq!(DataType::Int8.byte_length(), 1);
    }

    #[test]
    fn float32_store_rounds_to_single_precision() {
        let stored = DataType::Float32.round_on_store(0.1);
        assert_eq!(stored, f64::from(0.1f32));
        assert_ne!(stored, 0.1);
    }

    #[test]
    fn float16_store_rounds_to_half_precision() {
        assert_eq!(DataType::Float16.round_on_store(1.0004), 1.0);
        assert_eq!(DataType::Float16.round_on_store(65504.0), 65504.0);
        assert!(DataType::Float16.round_on_store(1.0e6).is_infinite());
    }

    #[test]
    fn integer_store_truncates_and_saturates() {
        assert_eq!(DataType::Int32.round_on_store(-2.7), -2.0);
        assert_eq!(DataType::Uint32.round_on_store(-5.0), 0.0);
        assert_eq!(DataType::Int8.round_on_store(300.0), 127.0);
        assert_eq!(DataType::Uint8.round_on_store(f64::NAN), 0.0);
    }

    #[test]
    fn float32_ulp_distance_counts_representable_steps() {
        let one = 1.0f32;
        let next = f32::from_bits(one.to_bits() + 3);
        assert_eq!(
            DataType::Float32.ulp_distance(f64::from(one), f64::from(next)),
            3
        );
        assert_eq!(DataType::Float32.ulp_distance(0.0, -0.0), 0);

        let tiny = f64::from(f32::from_bits(1));
        assert_eq!(DataType::Float32.ulp_distance(tiny, -tiny), 2);
    }

    #[test]
    fn float16_ulp_distance_counts_half_steps() {
        let next = 1.0 + 2.0f64.powi(-10);
        assert_eq!(DataType::Float16.ulp_distance(1.0, next), 1);
        assert_eq!(DataType::Float16.ulp_distance(2.0, 2.0), 0);
    }

    #[test]
    fn nan_handling_in_ulp_distance() {
        assert_eq!(DataType::Float32.ulp_distance(f64::NAN, f64::NAN), 0);
        assert_eq!(DataType::Float32.ulp_distance(f64::NAN, 1.0), u64::MAX);
        assert_eq!(DataType::Float16.ulp_distance(1.0, f64::NAN), u64::MAX);
    }

    #[test]
    fn infinities_compare_exactly() {
        assert_eq!(
            DataType::Float32.ulp_distance(f64::NEG_INFINITY, f64::NEG_INFINITY),
            0
        );
        assert_eq!(
            DataType::Float32.ulp_distance(f64::INFINITY, f64::from(f32::MAX)),
            1
        );
    }

    #[test]
    fn integer_ulp_distance_is_absolute_difference() {
        assert_eq!(DataType::Int32.ulp_distance(10.0, 7.0), 3);
        assert_eq!(DataType::Uint32.ulp_distance(4.0, 4.0), 0);
    }
}
