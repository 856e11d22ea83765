use std::fs;
use std::path::Path;

use log::debug;
use tch::{Kind, Tensor};

use crate::error::Result;

/// Value range of a rendered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelRange {
    /// `[0, 1]`.
    Unit,
    /// `[-1, 1]`.
    Symmetric,
}

/// Maps `image` (`n, 3, h, w` or `3, h, w`) to `[0, 255]` bytes, first
/// batch item only.
pub fn to_pixels(image: &Tensor, range: PixelRange) -> Tensor {
    let image = image.detach().to_kind(Kind::Float);
    let image = if image.dim() == 4 { image.get(0) } else { image };
    let unit = match range {
        PixelRange::Unit => image.clamp(0.0, 1.0),
        PixelRange::Symmetric => (image.clamp(-1.0, 1.0) + 1.0) / 2.0,
    };
    (unit * 255.0).round().to_kind(Kind::Uint8)
}

/// Writes one frame, creating its directory when missing. The format
/// follows the file extension.
pub fn save_frame(image: &Tensor, range: PixelRange, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.is_dir() {
            fs::create_dir_all(dir)?;
        }
    }
    let pixels = to_pixels(image, range).to_device(tch::Device::Cpu);
    tch::vision::image::save(&pixels, path)?;
    debug!("Saved frame: {}", path.display());
    Ok(())
}
