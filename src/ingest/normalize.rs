use crate::frame::{FrameError, PixelFormat};

/// Expand any supported layout into packed RGB24.
pub(crate) fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>, FrameError> {
    let expected = format.expected_len(width, height)?;
    if pixels.len() != expected {
        return Err(FrameError::LengthMismatch {
            format,
            expected,
            actual: pixels.len(),
        });
    }

    let rgb = match format {
        PixelFormat::Rgb24 => pixels.to_vec(),
        PixelFormat::Bgr24 => pixels
            .chunks_exact(3)
            .flat_map(|bgr| [bgr[2], bgr[1], bgr[0]])
            .collect(),
        PixelFormat::Gray8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        PixelFormat::Nv12 => nv12_to_rgb(pixels, width as usize, height as usize),
    };
    Ok(rgb)
}

/// Full luma plane followed by interleaved UV at half resolution in both axes.
fn nv12_to_rgb(pixels: &[u8], width: usize, height: usize) -> Vec<u8> {
    let (luma, chroma) = pixels.split_at(width * height);
    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in 0..height {
        let uv_row = &chroma[(row / 2) * width..];
        for col in 0..width {
            let uv = (col / 2) * 2;
            rgb.extend_from_slice(&yuv_to_rgb(
                luma[row * width + col],
                uv_row[uv],
                uv_row[uv + 1],
            ));
        }
    }
    rgb
}

// BT.601 full range.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f32::from(y);
    let u = f32::from(u) - 128.0;
    let v = f32::from(v) - 128.0;
    [
        to_u8(y + 1.402 * v),
        to_u8(y - 0.344_136 * u - 0.714_136 * v),
        to_u8(y + 1.772 * u),
    ]
}

fn to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
