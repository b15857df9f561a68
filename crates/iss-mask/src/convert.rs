//! Adapters between editor-side polygon instances and unified payloads.
//!
//! Saving always builds a fresh [`MaskBuilder`] from the complete current
//! instance set, so one payload per frame reflects everything live at that
//! moment. Loading turns each payload instance back into one polygon with
//! the identity and tracking data it was saved with.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::builder::MaskBuilder;
use crate::error::Result;
use crate::identity::{restore_tracking, synthetic_identity, IdentityTable};
use crate::params::MaskParams;
use crate::raster::combined_bounding_box;
use crate::rle::CodecVersion;
use crate::types::{InstanceData, Point, SegmentationRegion, TrackingRecord, UnifiedMaskPayload};

/// The frame a set of live instances belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameContext {
    pub image_id: String,
    pub width: u32,
    pub height: u32,
}

/// A polygon instance as the editor holds it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveInstance {
    /// Stable editor identity (object uuid).
    pub identity: String,
    pub points: Vec<Point>,
    pub class_id: u32,
    #[serde(default)]
    pub class_name: String,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
    #[serde(default = "visible")]
    pub is_visible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn full_confidence() -> f64 {
    1.0
}

fn visible() -> bool {
    true
}

/// A polygon instance reconstructed from a payload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoredInstance {
    pub identity: String,
    pub instance_id: u16,
    pub region_id: String,
    pub points: Vec<Point>,
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f64,
    pub is_visible: bool,
    pub track_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<RestoredInstance> for LiveInstance {
    fn from(r: RestoredInstance) -> Self {
        LiveInstance {
            identity: r.identity,
            points: r.points,
            class_id: r.class_id,
            class_name: r.class_name,
            confidence: r.confidence,
            is_visible: r.is_visible,
            track_id: Some(r.track_id),
            track_name: r.track_name,
            created_at: Some(r.created_at),
        }
    }
}

/// Build the single payload describing every live instance of a frame.
///
/// `previous` is the payload last saved for this frame, if any; its
/// identity table keeps instance ids, and so tracking keys, stable.
/// Instances without points or repeating an identity are skipped.
pub fn build_payload_from_live_instances(
    frame: &FrameContext,
    instances: &[LiveInstance],
    previous: Option<&UnifiedMaskPayload>,
    params: &MaskParams,
) -> Result<UnifiedMaskPayload> {
    let now = Utc::now();
    let image_id = if frame.image_id.is_empty() {
        format!("image_{}", now.timestamp_millis())
    } else {
        frame.image_id.clone()
    };
    let width = if frame.width == 0 { params.fallback_width } else { frame.width };
    let height = if frame.height == 0 { params.fallback_height } else { frame.height };

    let mut seen = HashSet::new();
    let mut live: Vec<&LiveInstance> = Vec::with_capacity(instances.len());
    for inst in instances {
        if inst.points.is_empty() {
            warn!(identity = %inst.identity, "skipping live instance without points");
            continue;
        }
        if !seen.insert(inst.identity.as_str()) {
            warn!(identity = %inst.identity, "skipping live instance with duplicate identity");
            continue;
        }
        live.push(inst);
    }

    let mut table = previous.map(IdentityTable::from_payload).unwrap_or_default();
    table.retain(&seen);

    let mut builder = MaskBuilder::with_params(image_id, width, height, params.clone());
    let mut tracking = BTreeMap::new();
    for inst in live {
        let id = table.allocate(&inst.identity)?;
        let class_name = if inst.class_name.is_empty() {
            params.default_class_name.clone()
        } else {
            inst.class_name.clone()
        };
        builder.add_segmentation_region(SegmentationRegion {
            id: format!("region_{id}"),
            instance_id: id,
            class_id: inst.class_id,
            class_name,
            confidence: inst.confidence,
            polygon_points: inst.points.clone(),
            is_visible: inst.is_visible,
            created_at: inst.created_at.unwrap_or(now),
        })?;
        tracking.insert(
            id.to_string(),
            TrackingRecord {
                track_id: inst.track_id.clone(),
                track_name: inst.track_name.clone(),
                original_identity: inst.identity.clone(),
            },
        );
    }

    let mut payload = builder.build()?;
    payload.combined_bounding_box =
        combined_bounding_box(payload.instances.values().map(|inst| &inst.bounding_box));
    payload.total_area = Some(payload.instances.values().map(|inst| inst.area).sum());
    payload.tracking_info = Some(tracking);
    debug!(
        image_id = %payload.image_id,
        instances = payload.metadata.total_instances,
        "converted live instances to unified payload"
    );
    Ok(payload)
}

/// Rebuild one polygon instance per payload entry, in paint order.
///
/// Saving the result again registers the instances in that same order, so
/// an unedited frame keeps its overlaps byte for byte.
///
/// Saved tracking records restore each instance's identity and track id;
/// without one, a synthetic identity and track id derived from
/// `base_track_id` (or the image id) are used. Never fails.
pub fn instances_from_payload(
    payload: &UnifiedMaskPayload,
    base_track_id: Option<&str>,
) -> Vec<RestoredInstance> {
    if let Err(err) = CodecVersion::of_payload(payload.codec_version) {
        warn!(image_id = %payload.image_id, %err, "restoring polygons from payload with unreadable mask");
    }

    let table = IdentityTable::from_payload(payload);
    let by_id: HashMap<u16, &InstanceData> =
        payload.instances.values().map(|inst| (inst.id, inst)).collect();

    payload
        .paint_order()
        .into_iter()
        .filter_map(|id| by_id.get(&id).copied())
        .map(|inst| {
            let identity = table
                .identity_of(inst.id)
                .map(str::to_string)
                .unwrap_or_else(|| synthetic_identity(&payload.image_id, inst.id));
            let (track_id, track_name) = restore_tracking(
                payload.tracking_for(inst.id),
                base_track_id,
                &payload.image_id,
                inst.id,
            );
            RestoredInstance {
                identity,
                instance_id: inst.id,
                region_id: format!("restored_region_{}", inst.id),
                points: inst.polygon_points.clone(),
                class_id: inst.class_id,
                class_name: inst.class_name.clone(),
                confidence: inst.confidence,
                is_visible: inst.is_visible,
                track_id,
                track_name,
                created_at: inst.created_at,
            }
        })
        .collect()
}
