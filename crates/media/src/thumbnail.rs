//! Thumbnail derivation
//!
//! Inside fits preserving aspect ratio, encoded as JPEG at quality 85.
//! A size that fails to derive is simply absent from the result.

use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use std::io::Cursor;
use tracing::debug;

/// Fixed set of derived sizes (longest edge, px).
pub const THUMBNAIL_SIZES: [u32; 6] = [64, 128, 256, 512, 1024, 2048];

const JPEG_QUALITY: u8 = 85;

/// Derived thumbnails keyed by size.
#[derive(Debug, Default)]
pub struct ThumbnailSet {
    pub entries: Vec<(u32, Vec<u8>)>,
}

impl ThumbnailSet {
    pub fn sizes(&self) -> Vec<u32> {
        self.entries.iter().map(|(size, _)| *size).collect()
    }
}

/// Derive the full thumbnail set from raw image bytes.
///
/// Non-decodable input (videos, corrupt files) yields an empty set; that is
/// not an error, the upload itself still succeeds.
pub fn derive_thumbnails(bytes: &[u8]) -> ThumbnailSet {
    let Ok(source) = image::load_from_memory(bytes) else {
        debug!("upload is not a decodable image, skipping thumbnails");
        return ThumbnailSet::default();
    };

    let mut set = ThumbnailSet::default();
    for size in THUMBNAIL_SIZES {
        // Never upscale: sizes above the source resolution are absent.
        if size > source.width() && size > source.height() {
            continue;
        }
        match encode_thumbnail(&source, size) {
            Ok(data) => set.entries.push((size, data)),
            Err(e) => debug!(size, error = %e, "thumbnail derivation failed"),
        }
    }
    set
}

fn encode_thumbnail(source: &DynamicImage, size: u32) -> Result<Vec<u8>, image::ImageError> {
    let thumb = source.thumbnail(size, size);
    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    // JPEG has no alpha channel.
    thumb.to_rgb8().write_with_encoder(encoder)?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn derives_only_sizes_below_source_resolution() {
        let set = derive_thumbnails(&png_bytes(300, 200));
        assert_eq!(set.sizes(), vec![64, 128, 256]);
    }

    #[test]
    fn thumbnails_preserve_aspect_ratio() {
        let set = derive_thumbnails(&png_bytes(400, 200));
        let (_, data) = set
            .entries
            .iter()
            .find(|(size, _)| *size == 128)
            .expect("128px thumbnail");
        let thumb = image::load_from_memory(data).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (128, 64));
    }

    #[test]
    fn non_image_input_yields_empty_set() {
        let set = derive_thumbnails(b"definitely not an image");
        assert!(set.entries.is_empty());
    }
}
