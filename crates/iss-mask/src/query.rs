//! Read access to the pixels of a unified mask payload.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::rle::{decode_mask_blob, CodecVersion};
use crate::types::{Pixel, PixelInfo, RawMasks, UnifiedMaskPayload};

/// Lazily decompressing view over a payload.
///
/// The decompressed channels are cached per query. A query is meant for one
/// consumer at a time; share payloads, not queries.
#[derive(Debug)]
pub struct MaskQuery<'a> {
    payload: &'a UnifiedMaskPayload,
    raw: Option<RawMasks>,
}

impl<'a> MaskQuery<'a> {
    /// Wrap a payload without touching its blob.
    pub fn new(payload: &'a UnifiedMaskPayload) -> Self {
        MaskQuery { payload, raw: None }
    }

    pub fn payload(&self) -> &'a UnifiedMaskPayload {
        self.payload
    }

    pub fn is_decompressed(&self) -> bool {
        self.raw.is_some()
    }

    /// Decode the blob into full-size channels. Later calls are no-ops.
    pub fn decompress(&mut self) -> Result<()> {
        self.channels().map(|_| ())
    }

    /// The decompressed channels, decoding them on first use.
    pub fn channels(&mut self) -> Result<&RawMasks> {
        let raw = match self.raw.take() {
            Some(raw) => raw,
            None => {
                let version = CodecVersion::of_payload(self.payload.codec_version)?;
                let total = self.payload.image_dimensions.total_pixels() as usize;
                decode_mask_blob(&self.payload.compressed_mask, version, total)?
            }
        };
        Ok(self.raw.insert(raw))
    }

    /// Instance, class and confidence at a pixel; `None` outside the image.
    pub fn get_pixel_info(&mut self, x: u32, y: u32) -> Result<Option<PixelInfo>> {
        let dims = self.payload.image_dimensions;
        if x >= dims.width || y >= dims.height {
            return Ok(None);
        }
        let idx = y as usize * dims.width as usize + x as usize;
        let raw = self.channels()?;
        Ok(Some(PixelInfo {
            instance_id: raw.instance_id[idx],
            class_id: raw.class_id[idx],
            confidence: raw.confidence[idx] as f64 / 255.0,
        }))
    }

    /// Every pixel carrying `instance_id`, in row-major order.
    pub fn get_instance_pixels(&mut self, instance_id: u16) -> Result<Vec<Pixel>> {
        let width = self.payload.image_dimensions.width as usize;
        let raw = self.channels()?;
        Ok(raw
            .instance_id
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v == instance_id)
            .map(|(i, _)| Pixel {
                x: (i % width) as u32,
                y: (i / width) as u32,
            })
            .collect())
    }

    /// Distinct nonzero instance ids present in the raster.
    pub fn instance_ids(&mut self) -> Result<Vec<u16>> {
        let raw = self.channels()?;
        let ids: BTreeSet<u16> = raw.instance_id.iter().copied().filter(|&v| v != 0).collect();
        Ok(ids.into_iter().collect())
    }

    pub fn annotated_pixels(&mut self) -> Result<u64> {
        Ok(self.channels()?.annotated_pixels())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::builder::MaskBuilder;
    use crate::error::MaskError;
    use crate::types::{Point, SegmentationRegion};

    fn square_region(id: &str, x0: f64, y0: f64, size: f64, confidence: f64) -> SegmentationRegion {
        SegmentationRegion {
            id: id.into(),
            instance_id: 0,
            class_id: 2,
            class_name: "car".into(),
            confidence,
            polygon_points: vec![
                Point::new(x0, y0),
                Point::new(x0 + size, y0),
                Point::new(x0 + size, y0 + size),
                Point::new(x0, y0 + size),
            ],
            is_visible: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_lazy_decompress() {
        let mut b = MaskBuilder::new("img", 4, 4);
        b.add_segmentation_region(square_region("a", 0.0, 0.0, 4.0, 1.0)).unwrap();
        let payload = b.build().unwrap();

        let mut q = MaskQuery::new(&payload);
        assert!(!q.is_decompressed());
        q.decompress().unwrap();
        assert!(q.is_decompressed());
        q.decompress().unwrap();

        let info = q.get_pixel_info(0, 0).unwrap().unwrap();
        assert_eq!(info.instance_id, 1);
        assert_eq!(info.class_id, 2);
        assert!((info.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_range_pixel() {
        let b = MaskBuilder::new("img", 4, 3);
        let payload = b.build().unwrap();
        let mut q = MaskQuery::new(&payload);
        assert!(q.get_pixel_info(4, 0).unwrap().is_none());
        assert!(q.get_pixel_info(0, 3).unwrap().is_none());
        assert_eq!(q.get_pixel_info(3, 2).unwrap().unwrap().instance_id, 0);
    }

    #[test]
    fn test_instance_pixels_match_rasterization() {
        let mut b = MaskBuilder::new("img", 10, 10);
        let a = b.add_segmentation_region(square_region("a", 1.0, 1.0, 3.0, 0.4)).unwrap();
        let c = b.add_segmentation_region(square_region("c", 6.0, 5.0, 2.0, 0.9)).unwrap();
        let payload = b.build().unwrap();
        let mut q = MaskQuery::new(&payload);

        let pixels = q.get_instance_pixels(a).unwrap();
        assert_eq!(pixels.len(), 9);
        assert_eq!(pixels[0], Pixel { x: 1, y: 1 });
        for px in &pixels {
            let info = q.get_pixel_info(px.x, px.y).unwrap().unwrap();
            assert_eq!(info.instance_id, a);
            assert!((info.confidence - 0.4).abs() < 1.0 / 255.0);
        }
        assert_eq!(q.get_instance_pixels(c).unwrap().len(), 4);
        assert!(q.get_instance_pixels(99).unwrap().is_empty());
        assert_eq!(q.instance_ids().unwrap(), vec![a, c]);
        assert_eq!(q.annotated_pixels().unwrap(), payload.metadata.annotated_pixels);
    }

    #[test]
    fn test_unknown_codec_version_is_rejected() {
        let b = MaskBuilder::new("img", 2, 2);
        let mut payload = b.build().unwrap();
        payload.codec_version = Some(9);
        let mut q = MaskQuery::new(&payload);
        assert!(matches!(
            q.decompress(),
            Err(MaskError::UnsupportedCodecVersion(9))
        ));
        assert!(!q.is_decompressed());
    }

    #[test]
    fn test_corrupt_blob_is_an_error() {
        let mut b = MaskBuilder::new("img", 4, 4);
        b.add_segmentation_region(square_region("a", 0.0, 0.0, 2.0, 1.0)).unwrap();
        let mut payload = b.build().unwrap();
        payload.compressed_mask = "not a mask".into();
        let mut q = MaskQuery::new(&payload);
        assert!(q.get_pixel_info(0, 0).is_err());
    }
}
