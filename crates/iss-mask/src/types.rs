use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MaskError, Result};

/// A polygon vertex in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }
}

/// An integer pixel position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct Pixel {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

impl ImageDimensions {
    pub fn total_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// One ISS region as stored in a payload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceData {
    /// Raster instance id, 1..=65535.
    pub id: u16,
    pub class_id: u32,
    #[serde(default)]
    pub class_name: String,
    pub confidence: f64,
    #[serde(default)]
    pub area: f64,
    #[serde(default)]
    pub bounding_box: BoundingBox,
    pub polygon_points: Vec<Point>,
    #[serde(default = "default_visible")]
    pub is_visible: bool,
    pub created_at: DateTime<Utc>,
}

fn default_visible() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClassData {
    pub id: u32,
    pub name: String,
    pub color: String,
}

/// Editor-side tracking identity carried across save/load cycles.
///
/// Keyed in the payload by the stringified raster instance id. The
/// `original_identity` column doubles as the persisted identity table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_name: Option<String>,
    /// Stable editor identity. Older payloads call this `originalUuid`.
    #[serde(default, alias = "originalUuid")]
    pub original_identity: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadMetadata {
    pub total_instances: usize,
    pub total_pixels: u64,
    pub annotated_pixels: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The persisted document describing every ISS instance of one image.
///
/// A payload is a snapshot: nothing that happens to the builder after
/// `build()` reaches it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedMaskPayload {
    pub image_id: String,
    pub image_dimensions: ImageDimensions,
    /// Blob layout version. Absent means the legacy layout (1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_version: Option<u32>,
    pub compressed_mask: String,
    pub instances: BTreeMap<String, InstanceData>,
    #[serde(default)]
    pub classes: BTreeMap<String, ClassData>,
    /// Instance ids in the order they were painted; later ids win overlaps.
    /// Older payloads lack it and are replayed in ascending id order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_order: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_info: Option<BTreeMap<String, TrackingRecord>>,
    /// Union of all instance boxes as a 4-point rectangle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_bounding_box: Option<Vec<Point>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_area: Option<f64>,
    pub metadata: PayloadMetadata,
}

/// Envelope summary attached next to a unified payload when it is saved.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssMetadata {
    pub storage_type: String,
    pub instance_count: usize,
    pub image_dimensions: ImageDimensions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UnifiedMaskPayload {
    pub fn has_instances(&self) -> bool {
        !self.instances.is_empty()
    }

    /// Tracking record for a raster instance id, if one was saved.
    pub fn tracking_for(&self, id: u16) -> Option<&TrackingRecord> {
        self.tracking_info.as_ref()?.get(&id.to_string())
    }

    /// Instance ids in paint order.
    ///
    /// Follows `registrationOrder` for the instances it names; any instance
    /// it misses is appended in ascending id order.
    pub fn paint_order(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.instances.values().map(|inst| inst.id).collect();
        ids.sort_unstable();
        let Some(stored) = &self.registration_order else {
            return ids;
        };

        let mut placed = HashSet::new();
        let mut order: Vec<u16> = stored
            .iter()
            .copied()
            .filter(|id| ids.binary_search(id).is_ok() && placed.insert(*id))
            .collect();
        order.extend(ids.into_iter().filter(|id| !placed.contains(id)));
        order
    }

    pub fn summary(&self) -> IssMetadata {
        IssMetadata {
            storage_type: "unified_mask".into(),
            instance_count: self.metadata.total_instances,
            image_dimensions: self.image_dimensions,
            created_at: self.metadata.created_at,
            updated_at: self.metadata.updated_at,
        }
    }

    /// Check the structural invariants of a payload.
    pub fn validate(&self) -> Result<()> {
        let total = self.image_dimensions.total_pixels();
        if self.metadata.total_pixels != total {
            return Err(MaskError::InvalidPayload(format!(
                "totalPixels {} does not match {}x{}",
                self.metadata.total_pixels,
                self.image_dimensions.width,
                self.image_dimensions.height
            )));
        }
        if self.metadata.annotated_pixels > total {
            return Err(MaskError::InvalidPayload(format!(
                "annotatedPixels {} exceeds totalPixels {}",
                self.metadata.annotated_pixels, total
            )));
        }
        if self.metadata.total_instances != self.instances.len() {
            return Err(MaskError::InvalidPayload(format!(
                "totalInstances {} but {} instance entries",
                self.metadata.total_instances,
                self.instances.len()
            )));
        }
        for (key, inst) in &self.instances {
            if inst.id == 0 {
                return Err(MaskError::InvalidPayload(format!(
                    "instance under key {key} has id 0"
                )));
            }
            if *key != inst.id.to_string() {
                return Err(MaskError::InvalidPayload(format!(
                    "instance key {key} does not match id {}",
                    inst.id
                )));
            }
        }
        if let Some(order) = &self.registration_order {
            let mut listed = order.clone();
            listed.sort_unstable();
            let mut ids: Vec<u16> = self.instances.values().map(|inst| inst.id).collect();
            ids.sort_unstable();
            if listed != ids {
                return Err(MaskError::InvalidPayload(
                    "registrationOrder must list every instance id exactly once".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Builder-side working record for one region, 1:1 with an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationRegion {
    /// Builder-local key; removal by this key cascades to the instance.
    pub id: String,
    /// 0 asks the builder to assign the next free id.
    pub instance_id: u16,
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f64,
    pub polygon_points: Vec<Point>,
    pub is_visible: bool,
    pub created_at: DateTime<Utc>,
}

/// The three raw channels of a unified mask, row-major, `width * height` long.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawMasks {
    pub instance_id: Vec<u16>,
    pub class_id: Vec<u8>,
    pub confidence: Vec<u8>,
}

impl RawMasks {
    pub fn zeroed(len: usize) -> Self {
        RawMasks {
            instance_id: vec![0; len],
            class_id: vec![0; len],
            confidence: vec![0; len],
        }
    }

    /// Number of pixels owned by some instance.
    pub fn annotated_pixels(&self) -> u64 {
        self.instance_id.iter().filter(|&&v| v != 0).count() as u64
    }
}

/// What a single pixel of a unified mask says.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelInfo {
    pub instance_id: u16,
    pub class_id: u8,
    /// Dequantized confidence in 0..=1.
    pub confidence: f64,
}
