//! Unified mask builder: one image's ISS instances in, one payload out.
//!
//! Instances are rasterized in registration order into three channels
//! (instance id, class id, quantized confidence). Where polygons overlap the
//! later registration wins; there is no other z-ordering.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{MaskError, Result};
use crate::params::MaskParams;
use crate::raster::{bounding_box, polygon_area, polygon_to_pixels};
use crate::rle::{encode_mask_blob, CodecVersion};
use crate::types::{
    ClassData, ImageDimensions, InstanceData, PayloadMetadata, RawMasks, SegmentationRegion,
    UnifiedMaskPayload,
};

/// Largest id the 16-bit instance channel can hold.
pub const MAX_INSTANCE_ID: u32 = u16::MAX as u32;

/// Quantize a 0..=1 confidence into the 8-bit confidence channel.
pub fn quantize_confidence(confidence: f64) -> u8 {
    (confidence.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Snapshot of a builder's registries, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderSummary {
    pub image_id: String,
    pub width: u32,
    pub height: u32,
    pub regions: usize,
    pub instances: usize,
    pub classes: usize,
    pub next_instance_id: u32,
}

/// Registries for the ISS instances of exactly one image.
#[derive(Debug, Clone)]
pub struct MaskBuilder {
    image_id: String,
    width: u32,
    height: u32,
    params: MaskParams,
    instances: HashMap<u16, InstanceData>,
    /// Registration order of instance ids; drives overlap resolution.
    order: Vec<u16>,
    classes: BTreeMap<u32, ClassData>,
    regions: HashMap<String, SegmentationRegion>,
    next_instance_id: u32,
}

impl MaskBuilder {
    pub fn new(image_id: impl Into<String>, width: u32, height: u32) -> Self {
        Self::with_params(image_id, width, height, MaskParams::default())
    }

    pub fn with_params(
        image_id: impl Into<String>,
        width: u32,
        height: u32,
        params: MaskParams,
    ) -> Self {
        MaskBuilder {
            image_id: image_id.into(),
            width,
            height,
            params,
            instances: HashMap::new(),
            order: Vec::new(),
            classes: BTreeMap::new(),
            regions: HashMap::new(),
            next_instance_id: 1,
        }
    }

    /// Rebuild a builder holding every instance of a loaded payload.
    ///
    /// Instances are registered in the payload's paint order under
    /// `restored_region_<id>`, so rasterizing again reproduces the saved
    /// overlaps. The id counter is seeded past the largest id so new regions
    /// never reuse one.
    pub fn from_payload(payload: &UnifiedMaskPayload, params: MaskParams) -> Result<Self> {
        let mut builder = Self::with_params(
            payload.image_id.clone(),
            payload.image_dimensions.width,
            payload.image_dimensions.height,
            params,
        );
        let by_id: HashMap<u16, &InstanceData> =
            payload.instances.values().map(|inst| (inst.id, inst)).collect();

        let mut max_id = 0u32;
        for id in payload.paint_order() {
            let Some(inst) = by_id.get(&id) else {
                continue;
            };
            max_id = max_id.max(id as u32);
            builder.add_segmentation_region(SegmentationRegion {
                id: format!("restored_region_{id}"),
                instance_id: id,
                class_id: inst.class_id,
                class_name: inst.class_name.clone(),
                confidence: inst.confidence,
                polygon_points: inst.polygon_points.clone(),
                is_visible: inst.is_visible,
                created_at: inst.created_at,
            })?;
        }
        builder.set_next_instance_id(max_id + 1);
        Ok(builder)
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn next_instance_id(&self) -> u32 {
        self.next_instance_id
    }

    pub fn instance(&self, id: u16) -> Option<&InstanceData> {
        self.instances.get(&id)
    }

    /// Seed the auto-increment counter, e.g. past the ids of a loaded payload.
    /// Id 0 is reserved for background, so 0 seeds the counter at 1.
    pub fn set_next_instance_id(&mut self, next: u32) {
        self.next_instance_id = next.max(1);
    }

    /// Register a region and its instance, returning the instance id used.
    ///
    /// An `instance_id` of 0 takes the next auto-increment id; an explicit
    /// id is accepted as-is and pushes the counter past it. Registering an
    /// id that already exists overwrites that instance in place.
    pub fn add_segmentation_region(&mut self, mut region: SegmentationRegion) -> Result<u16> {
        if region.class_id > u8::MAX as u32 {
            return Err(MaskError::ClassIdOutOfRange(region.class_id));
        }
        region.instance_id = self.ensure_unique_instance_id(region.instance_id)?;
        let id = region.instance_id;

        // A region key re-registered under a new id leaves no orphan behind.
        if let Some(previous) = self.regions.get(&region.id) {
            if previous.instance_id != id {
                let stale = previous.instance_id;
                self.instances.remove(&stale);
                self.order.retain(|&o| o != stale);
            }
        }
        // Only one region may own an instance id.
        self.regions
            .retain(|key, r| r.instance_id != id || *key == region.id);

        let instance = InstanceData {
            id,
            class_id: region.class_id,
            class_name: region.class_name.clone(),
            confidence: region.confidence,
            area: polygon_area(&region.polygon_points),
            bounding_box: bounding_box(&region.polygon_points),
            polygon_points: region.polygon_points.clone(),
            is_visible: region.is_visible,
            created_at: region.created_at,
        };
        if self.instances.insert(id, instance).is_none() {
            self.order.push(id);
        }
        self.register_class(region.class_id, &region.class_name);

        debug!(
            image_id = %self.image_id,
            region_id = %region.id,
            instance_id = id,
            class_id = region.class_id,
            vertices = region.polygon_points.len(),
            "registered segmentation region"
        );
        self.regions.insert(region.id.clone(), region);
        Ok(id)
    }

    fn ensure_unique_instance_id(&mut self, requested: u16) -> Result<u16> {
        if requested == 0 {
            if self.next_instance_id > MAX_INSTANCE_ID {
                return Err(MaskError::InstanceIdExhausted);
            }
            let id = self.next_instance_id as u16;
            self.next_instance_id += 1;
            Ok(id)
        } else {
            self.next_instance_id = self.next_instance_id.max(requested as u32 + 1);
            Ok(requested)
        }
    }

    fn register_class(&mut self, class_id: u32, class_name: &str) {
        match self.classes.get(&class_id) {
            Some(existing) if existing.name != class_name => {
                warn!(
                    class_id,
                    registered = %existing.name,
                    ignored = %class_name,
                    "class id already registered under another name"
                );
            }
            Some(_) => {}
            None => {
                self.classes.insert(
                    class_id,
                    ClassData {
                        id: class_id,
                        name: class_name.to_string(),
                        color: self.params.class_color(class_id),
                    },
                );
            }
        }
    }

    /// Remove a region and its instance. Unknown ids are ignored.
    pub fn remove_segmentation_region(&mut self, region_id: &str) -> bool {
        let Some(region) = self.regions.remove(region_id) else {
            return false;
        };
        self.instances.remove(&region.instance_id);
        self.order.retain(|&o| o != region.instance_id);
        true
    }

    /// Paint every registered instance into fresh raw channels.
    pub fn rasterize(&self) -> RawMasks {
        let total = self.width as usize * self.height as usize;
        let mut raw = RawMasks::zeroed(total);
        for id in &self.order {
            let Some(inst) = self.instances.get(id) else {
                continue;
            };
            let class_id = inst.class_id as u8;
            let confidence = quantize_confidence(inst.confidence);
            for px in polygon_to_pixels(&inst.polygon_points, self.width, self.height) {
                let idx = px.y as usize * self.width as usize + px.x as usize;
                raw.instance_id[idx] = inst.id;
                raw.class_id[idx] = class_id;
                raw.confidence[idx] = confidence;
            }
        }
        raw
    }

    /// Rasterize, compress and assemble a payload.
    ///
    /// Leaves the registries untouched; calling it again without changes
    /// yields the same instances, classes and mask.
    pub fn build(&self) -> Result<UnifiedMaskPayload> {
        let raw = self.rasterize();
        let version: CodecVersion = self.params.codec_version;
        let compressed_mask = encode_mask_blob(&raw, version)?;

        let instances: BTreeMap<String, InstanceData> = self
            .order
            .iter()
            .filter_map(|id| self.instances.get(id))
            .map(|inst| (inst.id.to_string(), inst.clone()))
            .collect();
        let classes: BTreeMap<String, ClassData> = self
            .classes
            .values()
            .map(|c| (c.id.to_string(), c.clone()))
            .collect();

        let dimensions = ImageDimensions {
            width: self.width,
            height: self.height,
        };
        let now = Utc::now();
        let metadata = PayloadMetadata {
            total_instances: instances.len(),
            total_pixels: dimensions.total_pixels(),
            annotated_pixels: raw.annotated_pixels(),
            created_at: now,
            updated_at: now,
        };
        debug!(
            image_id = %self.image_id,
            instances = metadata.total_instances,
            annotated_pixels = metadata.annotated_pixels,
            blob_len = compressed_mask.len(),
            "built unified mask payload"
        );

        Ok(UnifiedMaskPayload {
            image_id: self.image_id.clone(),
            image_dimensions: dimensions,
            codec_version: Some(version.number()),
            compressed_mask,
            instances,
            classes,
            registration_order: Some(self.order.clone()),
            tracking_info: None,
            combined_bounding_box: None,
            total_area: None,
            metadata,
        })
    }

    pub fn summary(&self) -> BuilderSummary {
        BuilderSummary {
            image_id: self.image_id.clone(),
            width: self.width,
            height: self.height,
            regions: self.regions.len(),
            instances: self.instances.len(),
            classes: self.classes.len(),
            next_instance_id: self.next_instance_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::rle::decode_mask_blob;
    use crate::types::Point;

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn region(id: &str, instance_id: u16, class_id: u32, points: &[(f64, f64)]) -> SegmentationRegion {
        SegmentationRegion {
            id: id.into(),
            instance_id,
            class_id,
            class_name: format!("class-{class_id}"),
            confidence: 1.0,
            polygon_points: points.iter().map(|&(x, y)| Point::new(x, y)).collect(),
            is_visible: true,
            created_at: created(),
        }
    }

    const SQUARE4: [(f64, f64); 4] = [(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0)];

    #[test]
    fn test_auto_ids_strictly_increase_from_one() {
        let mut b = MaskBuilder::new("img", 10, 10);
        let ids: Vec<u16> = ["a", "b", "c"]
            .iter()
            .map(|r| b.add_segmentation_region(region(r, 0, 1, &SQUARE4)).unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_manual_id_advances_counter() {
        let mut b = MaskBuilder::new("img", 10, 10);
        assert_eq!(b.add_segmentation_region(region("a", 7, 1, &SQUARE4)).unwrap(), 7);
        assert_eq!(b.add_segmentation_region(region("b", 0, 1, &SQUARE4)).unwrap(), 8);
        // A lower manual id does not pull the counter back.
        assert_eq!(b.add_segmentation_region(region("c", 3, 1, &SQUARE4)).unwrap(), 3);
        assert_eq!(b.next_instance_id(), 9);
    }

    #[test]
    fn test_id_space_exhausted() {
        let mut b = MaskBuilder::new("img", 4, 4);
        b.set_next_instance_id(MAX_INSTANCE_ID);
        assert_eq!(
            b.add_segmentation_region(region("a", 0, 1, &SQUARE4)).unwrap(),
            u16::MAX
        );
        assert!(matches!(
            b.add_segmentation_region(region("b", 0, 1, &SQUARE4)),
            Err(MaskError::InstanceIdExhausted)
        ));
    }

    #[test]
    fn test_zero_counter_restarts_at_one() {
        let mut b = MaskBuilder::new("img", 4, 4);
        b.set_next_instance_id(0);
        assert_eq!(b.next_instance_id(), 1);
        assert_eq!(b.add_segmentation_region(region("a", 0, 1, &SQUARE4)).unwrap(), 1);
    }

    #[test]
    fn test_class_id_out_of_range() {
        let mut b = MaskBuilder::new("img", 4, 4);
        assert!(matches!(
            b.add_segmentation_region(region("a", 0, 256, &SQUARE4)),
            Err(MaskError::ClassIdOutOfRange(256))
        ));
        assert_eq!(b.next_instance_id(), 1);
        assert_eq!(b.summary().instances, 0);
    }

    #[test]
    fn test_full_image_scenario() {
        let mut b = MaskBuilder::new("img", 4, 4);
        let id = b.add_segmentation_region(region("a", 0, 2, &SQUARE4)).unwrap();
        let payload = b.build().unwrap();

        assert_eq!(payload.metadata.total_pixels, 16);
        assert_eq!(payload.metadata.annotated_pixels, 16);
        assert_eq!(payload.metadata.total_instances, 1);
        let inst = &payload.instances[&id.to_string()];
        assert!((inst.area - 16.0).abs() < 1e-9);
        assert_eq!(payload.classes["2"].color, "#0000FF");
        assert_eq!(payload.codec_version, Some(2));
        payload.validate().unwrap();

        let raw = decode_mask_blob(&payload.compressed_mask, CodecVersion::Packed, 16).unwrap();
        assert!(raw.instance_id.iter().all(|&v| v == id));
        assert!(raw.confidence.iter().all(|&v| v == 255));
    }

    #[test]
    fn test_degenerate_region_does_not_disturb_others() {
        let mut b = MaskBuilder::new("img", 8, 8);
        let line = b
            .add_segmentation_region(region("line", 0, 1, &[(0.0, 0.0), (7.0, 7.0)]))
            .unwrap();
        b.add_segmentation_region(region("sq", 0, 1, &SQUARE4)).unwrap();
        let payload = b.build().unwrap();

        assert_eq!(payload.instances[&line.to_string()].area, 0.0);
        assert_eq!(payload.metadata.total_instances, 2);
        assert_eq!(payload.metadata.annotated_pixels, 16);
    }

    #[test]
    fn test_last_registration_wins_overlap() {
        let mut b = MaskBuilder::new("img", 6, 6);
        let first = b
            .add_segmentation_region(region("a", 0, 1, &[(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0)]))
            .unwrap();
        let second = b
            .add_segmentation_region(region("b", 0, 3, &[(2.0, 2.0), (6.0, 2.0), (6.0, 6.0), (2.0, 6.0)]))
            .unwrap();
        let raw = b.rasterize();
        assert_eq!(raw.instance_id[0], first);
        assert_eq!(raw.instance_id[2 * 6 + 2], second);
        assert_eq!(raw.class_id[3 * 6 + 3], 3);
        assert_eq!(raw.annotated_pixels(), 16 + 16 - 4);

        // Overwriting the first instance keeps its place in the order.
        b.add_segmentation_region(region("a", first, 1, &[(0.0, 0.0), (5.0, 0.0), (5.0, 5.0), (0.0, 5.0)]))
            .unwrap();
        let raw = b.rasterize();
        assert_eq!(raw.instance_id[2 * 6 + 2], second);
    }

    #[test]
    fn test_remove_cascades_to_instance() {
        let mut b = MaskBuilder::new("img", 4, 4);
        b.add_segmentation_region(region("a", 0, 1, &SQUARE4)).unwrap();
        assert!(!b.remove_segmentation_region("missing"));
        assert!(b.remove_segmentation_region("a"));
        let payload = b.build().unwrap();
        assert!(payload.instances.is_empty());
        assert_eq!(payload.metadata.annotated_pixels, 0);
        // Classes are registered lazily and never dropped.
        assert_eq!(payload.classes.len(), 1);
    }

    #[test]
    fn test_region_rekeyed_to_new_instance() {
        let mut b = MaskBuilder::new("img", 4, 4);
        b.add_segmentation_region(region("a", 5, 1, &SQUARE4)).unwrap();
        b.add_segmentation_region(region("a", 6, 1, &SQUARE4)).unwrap();
        assert!(b.instance(5).is_none());
        assert!(b.instance(6).is_some());
        assert_eq!(b.summary().regions, 1);
    }

    #[test]
    fn test_build_is_idempotent() {
        let mut b = MaskBuilder::new("img", 12, 12);
        b.add_segmentation_region(region("a", 0, 1, &[(1.0, 1.0), (9.0, 2.0), (5.0, 10.0)]))
            .unwrap();
        b.add_segmentation_region(region("b", 0, 4, &SQUARE4)).unwrap();
        let p1 = b.build().unwrap();
        let p2 = b.build().unwrap();
        assert_eq!(p1.instances, p2.instances);
        assert_eq!(p1.classes, p2.classes);
        assert_eq!(p1.compressed_mask, p2.compressed_mask);
        assert_eq!(b.summary().instances, 2);
    }

    #[test]
    fn test_payload_is_a_snapshot() {
        let mut b = MaskBuilder::new("img", 4, 4);
        b.add_segmentation_region(region("a", 0, 1, &SQUARE4)).unwrap();
        let before = b.build().unwrap();
        b.remove_segmentation_region("a");
        assert_eq!(before.instances.len(), 1);
    }

    #[test]
    fn test_legacy_codec_param() {
        let params = MaskParams {
            codec_version: CodecVersion::Legacy,
            ..MaskParams::new()
        };
        let mut b = MaskBuilder::with_params("img", 4, 4, params);
        b.add_segmentation_region(region("a", 0, 1, &SQUARE4)).unwrap();
        let payload = b.build().unwrap();
        assert_eq!(payload.codec_version, Some(1));
        let raw = decode_mask_blob(&payload.compressed_mask, CodecVersion::Legacy, 16).unwrap();
        assert_eq!(raw.annotated_pixels(), 16);
    }

    #[test]
    fn test_from_payload_seeds_counter() {
        let mut b = MaskBuilder::new("img", 4, 4);
        b.add_segmentation_region(region("a", 40, 1, &SQUARE4)).unwrap();
        b.add_segmentation_region(region("b", 3, 2, &SQUARE4)).unwrap();
        let payload = b.build().unwrap();

        assert_eq!(payload.registration_order, Some(vec![40, 3]));

        let mut restored = MaskBuilder::from_payload(&payload, MaskParams::new()).unwrap();
        assert_eq!(restored.next_instance_id(), 41);
        // Both squares cover the same pixels; the later registration stays on top.
        let saved = decode_mask_blob(&payload.compressed_mask, CodecVersion::Packed, 16).unwrap();
        assert_eq!(restored.rasterize(), saved);
        assert!(saved.instance_id.iter().all(|&v| v == 3));
        assert_eq!(restored.summary().instances, 2);
        assert_eq!(
            restored.add_segmentation_region(region("c", 0, 1, &SQUARE4)).unwrap(),
            41
        );
    }

    #[test]
    fn test_quantize_confidence() {
        assert_eq!(quantize_confidence(1.0), 255);
        assert_eq!(quantize_confidence(0.0), 0);
        assert_eq!(quantize_confidence(0.5), 128);
        assert_eq!(quantize_confidence(1.7), 255);
        assert_eq!(quantize_confidence(-0.2), 0);
    }
}
