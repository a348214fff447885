//! Buffer metadata carried by device addresses

use serde::Serialize;

/// Element type of a device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum DType {
    Bool,
    I8,
    U8,
    I32,
    U32,
    I64,
    F16,
    BF16,
    #[default]
    F32,
    F64,
}

/// Device-side memory layout tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Format {
    /// Whatever the producing kernel emits natively
    #[default]
    Default,
    Nchw,
    Nhwc,
    /// Fractal layout used by cube units
    FracZ,
    Nc1hwc0,
}

/// Declared format and element type of one kernel output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputDesc {
    pub format: Format,
    pub dtype: DType,
}

impl OutputDesc {
    pub fn new(format: Format, dtype: DType) -> Self {
        Self { format, dtype }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let desc = OutputDesc::default();
        assert_eq!(desc.format, Format::Default);
        assert_eq!(desc.dtype, DType::F32);
    }
}
