//! Screenshot capture with optional downscaling for the model.

use chrono::Utc;
use image::imageops::FilterType;
use image::ImageFormat;
use std::io::Cursor;

use super::connection::AdbConnection;
use crate::device::{DeviceError, Snapshot};

const PNG_MAGIC: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// Capture the screen with `adb exec-out screencap -p`.
///
/// When `max_edge` is set and the longest side of the screen exceeds it, the
/// image handed to the model is downscaled and the snapshot's scale factors
/// record how to map model coordinates back to device pixels.
pub async fn capture(
    conn: &AdbConnection,
    current_app: String,
    max_edge: Option<u32>,
) -> Result<Snapshot, DeviceError> {
    // exec-out streams the PNG to stdout without touching device storage
    let output = conn.run(&["exec-out", "screencap", "-p"]).await?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("Status: -1") || stderr.contains("Failed") || stderr.contains("error") {
        return Err(DeviceError::CaptureFailed(format!(
            "screen may be protected: {}",
            stderr.trim()
        )));
    }

    encode_for_model(&output.stdout, current_app, max_edge)
}

/// Validate raw PNG bytes and build a snapshot, downscaling when needed.
pub fn encode_for_model(
    png_data: &[u8],
    current_app: String,
    max_edge: Option<u32>,
) -> Result<Snapshot, DeviceError> {
    if png_data.len() < PNG_MAGIC.len() || &png_data[..PNG_MAGIC.len()] != PNG_MAGIC {
        return Err(DeviceError::CaptureFailed(format!(
            "invalid PNG data ({} bytes)",
            png_data.len()
        )));
    }

    let img = image::load_from_memory(png_data)
        .map_err(|e| DeviceError::CaptureFailed(format!("failed to decode screenshot: {}", e)))?;
    let (width, height) = (img.width(), img.height());

    let longest = width.max(height);
    let (png, scale_x, scale_y) = match max_edge {
        Some(limit) if limit > 0 && longest > limit => {
            let ratio = limit as f64 / longest as f64;
            let target_w = ((width as f64 * ratio).round() as u32).max(1);
            let target_h = ((height as f64 * ratio).round() as u32).max(1);
            let resized = img.resize_exact(target_w, target_h, FilterType::Triangle);

            let mut buffer = Cursor::new(Vec::new());
            resized
                .write_to(&mut buffer, ImageFormat::Png)
                .map_err(|e| DeviceError::CaptureFailed(format!("failed to encode screenshot: {}", e)))?;
            (
                buffer.into_inner(),
                width as f64 / target_w as f64,
                height as f64 / target_h as f64,
            )
        }
        _ => (png_data.to_vec(), 1.0, 1.0),
    };

    Ok(Snapshot {
        png,
        current_app,
        width,
        height,
        scale_x,
        scale_y,
        captured_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};

    fn png_of(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::new(width, height));
        let mut buffer = Cursor::new(Vec::new());
        img.write_to(&mut buffer, ImageFormat::Png).unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_rejects_non_png() {
        assert!(encode_for_model(b"not a png", "x".into(), None).is_err());
    }

    #[test]
    fn test_keeps_small_images_unscaled() {
        let snapshot = encode_for_model(&png_of(100, 200), "app".into(), Some(1280)).unwrap();
        assert_eq!((snapshot.width, snapshot.height), (100, 200));
        assert_eq!((snapshot.scale_x, snapshot.scale_y), (1.0, 1.0));
    }

    #[test]
    fn test_downscales_large_images() {
        let snapshot = encode_for_model(&png_of(400, 800), "app".into(), Some(200)).unwrap();
        assert_eq!((snapshot.width, snapshot.height), (400, 800));
        assert_eq!(snapshot.scale_x, 4.0);
        assert_eq!(snapshot.scale_y, 4.0);
        let small = image::load_from_memory(&snapshot.png).unwrap();
        assert_eq!((small.width(), small.height()), (100, 200));
    }
}
