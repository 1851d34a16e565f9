use std::io::Cursor;

use candle_core::{DType, Result, Tensor};
use ::image::{ImageFormat, RgbImage};

/// `[B, 3, H, W]` in `[0, 1]` → one RGB8 image per batch row.
///
/// Values are scaled by 255, clamped and truncated.
pub fn tensor_to_images(images: &Tensor) -> Result<Vec<RgbImage>> {
    let (b_sz, channels, height, width) = images.dims4()?;
    if channels != 3 {
        candle_core::bail!("expected 3 channels, got {channels}");
    }
    let pixels: Vec<u8> = (images.to_dtype(DType::F32)? * 255.0)?
        .clamp(0f32, 255f32)?
        .permute((0, 2, 3, 1))?
        .flatten_all()?
        .to_vec1::<f32>()?
        .into_iter()
        .map(|v| v as u8)
        .collect();

    let frame = height * width * 3;
    pixels
        .chunks(frame)
        .take(b_sz)
        .map(|chunk| {
            RgbImage::from_raw(width as u32, height as u32, chunk.to_vec()).ok_or_else(|| {
                candle_core::Error::Msg(format!("pixel buffer does not fit {width}x{height}"))
            })
        })
        .collect()
}

/// Encode an image as PNG bytes.
pub fn encode_png(image: &RgbImage) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}
