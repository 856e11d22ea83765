use tch::{Device, TchError};

/// Errors raised while building losses or stepping the optimizer.
#[derive(thiserror::Error, Debug)]
pub enum SynthError {
    #[error("shape mismatch in {op}: {detail}")]
    ShapeMismatch { op: &'static str, detail: String },
    #[error("device mismatch in {op}: expected {expected:?}, found {found:?}")]
    DeviceMismatch {
        op: &'static str,
        expected: Device,
        found: Device,
    },
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("model error: {0}")]
    Model(String),
    #[error(transparent)]
    Torch(#[from] TchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SynthError>;

/// Fails fast when a collaborator hands back a tensor on another device.
pub fn ensure_device(op: &'static str, expected: Device, tensor: &tch::Tensor) -> Result<()> {
    let found = tensor.device();
    if found != expected {
        return Err(SynthError::DeviceMismatch {
            op,
            expected,
            found,
        });
    }
    Ok(())
}

pub fn shape_mismatch(op: &'static str, detail: impl Into<String>) -> SynthError {
    SynthError::ShapeMismatch {
        op,
        detail: detail.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Kind, Tensor};

    #[test]
    fn same_device_passes() {
        let t = Tensor::zeros([2], (Kind::Float, Device::Cpu));
        assert!(ensure_device("test", Device::Cpu, &t).is_ok());
    }

    #[test]
    fn other_device_is_rejected() {
        let t = Tensor::zeros([2], (Kind::Float, Device::Cpu));
        let err = ensure_device("encode", Device::Cuda(0), &t).unwrap_err();
        assert!(matches!(err, SynthError::DeviceMismatch { op: "encode", .. }));
    }
}
