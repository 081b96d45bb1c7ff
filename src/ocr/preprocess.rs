//! Upload preprocessing before OCR.
//!
//! Images with a side longer than [`MAX_IMAGE_SIDE`] are downscaled and
//! re-encoded as PNG. Anything that does not decode as an image is passed
//! through untouched. Decoding is CPU-bound, so request handlers go through
//! [`prepare`], which runs it on the blocking pool.

use axum::body::Bytes;
use image::{imageops::FilterType, ImageOutputFormat};
use std::io::Cursor;
use tracing::{debug, error, warn};

pub const MAX_IMAGE_SIDE: u32 = 2048;

#[derive(Debug, Clone)]
pub struct Prepared {
    pub data: Vec<u8>,
    /// Original `(width, height)` if the upload decoded as an image.
    pub dimensions: Option<(u32, u32)>,
    pub resized: bool,
}

/// [`clamp_dimensions`] on the blocking pool. If the task dies the upload is
/// passed through unchanged.
pub async fn prepare(data: Bytes) -> Prepared {
    let input = data.clone();
    match tokio::task::spawn_blocking(move || clamp_dimensions(input.to_vec())).await {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("Image preprocessing task failed, sending original: {}", e);
            Prepared {
                data: data.to_vec(),
                dimensions: None,
                resized: false,
            }
        }
    }
}

pub fn clamp_dimensions(data: Vec<u8>) -> Prepared {
    let passthrough = |data| Prepared {
        data,
        dimensions: None,
        resized: false,
    };

    let Ok(format) = image::guess_format(&data) else {
        return passthrough(data);
    };
    let img = match image::load_from_memory_with_format(&data, format) {
        Ok(img) => img,
        Err(e) => {
            debug!("Upload looks like {:?} but does not decode: {}", format, e);
            return passthrough(data);
        }
    };

    let dimensions = (img.width(), img.height());
    if dimensions.0.max(dimensions.1) <= MAX_IMAGE_SIDE {
        return Prepared {
            data,
            dimensions: Some(dimensions),
            resized: false,
        };
    }

    let resized = img.resize(MAX_IMAGE_SIDE, MAX_IMAGE_SIDE, FilterType::Triangle);
    let mut out = Cursor::new(Vec::new());
    match resized.write_to(&mut out, ImageOutputFormat::Png) {
        Ok(()) => {
            debug!(
                "Downscaled {}x{} image to {}x{}",
                dimensions.0,
                dimensions.1,
                resized.width(),
                resized.height()
            );
            Prepared {
                data: out.into_inner(),
                dimensions: Some(dimensions),
                resized: true,
            }
        }
        Err(e) => {
            warn!("Failed to re-encode downscaled image, sending original: {}", e);
            Prepared {
                data,
                dimensions: Some(dimensions),
                resized: false,
            }
        }
    }
}
