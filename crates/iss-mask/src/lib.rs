//! Unified instance-segmentation masks: many ISS polygons of one image stored
//! as a single three-channel, run-length compressed raster plus per-instance
//! metadata, with editor identities preserved across save/load cycles.

pub mod builder;
pub mod convert;
pub mod error;
pub mod identity;
pub mod params;
pub mod query;
pub mod raster;
pub mod rle;
pub mod types;

pub use builder::{BuilderSummary, MaskBuilder};
pub use convert::{
    build_payload_from_live_instances, instances_from_payload, FrameContext, LiveInstance,
    RestoredInstance,
};
pub use error::{MaskError, Result};
pub use identity::IdentityTable;
pub use params::MaskParams;
pub use query::MaskQuery;
pub use rle::CodecVersion;
pub use types::{
    BoundingBox, ClassData, ImageDimensions, InstanceData, IssMetadata, Pixel, PixelInfo, Point,
    RawMasks, SegmentationRegion, TrackingRecord, UnifiedMaskPayload,
};
