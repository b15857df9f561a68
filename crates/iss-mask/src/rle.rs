//! Run-length channel codec and the text layouts of the combined mask blob.
//!
//! A channel is a flat, row-major buffer of fixed-width unsigned values. It is
//! compressed into `(value, count)` runs whose counts are capped by the
//! channel width (255 for 8-bit channels, 65535 for 16-bit channels).
//!
//! Two blob layouts exist:
//! - version 1: base64 of `{"instanceId":[v,c,...],"classId":[...],"confidence":[...]}`
//! - version 2: each channel's flat `v,c,...` list in the COCO 6-bit character
//!   encoding, the three channel strings joined by `|`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{MaskError, Result};
use crate::types::RawMasks;

pub const INSTANCE_CHANNEL: &str = "instance-id";
pub const CLASS_CHANNEL: &str = "class-id";
pub const CONFIDENCE_CHANNEL: &str = "confidence";

/// Separator between channel segments in a version 2 blob. Never produced by
/// the character encoding, whose alphabet is `'0'..='o'`.
const SEGMENT_SEPARATOR: char = '|';

/// A fixed-width unsigned channel element.
pub trait ChannelValue: Copy + Eq + Default + Into<u32> + TryFrom<u32> {
    /// Longest run a single `(value, count)` pair may describe.
    const RUN_CAP: u32;
}

impl ChannelValue for u8 {
    const RUN_CAP: u32 = u8::MAX as u32;
}

impl ChannelValue for u16 {
    const RUN_CAP: u32 = u16::MAX as u32;
}

/// One run of identical values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run<T> {
    pub value: T,
    pub count: u32,
}

/// Compress a channel buffer into runs.
///
/// A run ends when the value changes or when it reaches `T::RUN_CAP`.
pub fn compress<T: ChannelValue>(buffer: &[T]) -> Vec<Run<T>> {
    let mut runs = Vec::new();
    let Some(&first) = buffer.first() else {
        return runs;
    };

    let mut current = Run { value: first, count: 0 };
    for &v in buffer {
        if v != current.value || current.count == T::RUN_CAP {
            runs.push(current);
            current = Run { value: v, count: 0 };
        }
        current.count += 1;
    }
    runs.push(current);
    runs
}

/// Expand runs back into a buffer of exactly `total_len` values.
///
/// Runs that are empty, longer than the cap, or that do not add up to
/// `total_len` are rejected before anything is allocated.
pub fn decompress<T: ChannelValue>(
    runs: &[Run<T>],
    total_len: usize,
    channel: &'static str,
) -> Result<Vec<T>> {
    let mut expanded: u64 = 0;
    for (i, run) in runs.iter().enumerate() {
        if run.count == 0 || run.count > T::RUN_CAP {
            return Err(MaskError::MalformedRuns {
                channel,
                reason: format!("run {i} has count {} outside 1..={}", run.count, T::RUN_CAP),
            });
        }
        expanded += run.count as u64;
    }
    if expanded != total_len as u64 {
        return Err(MaskError::ChannelLengthMismatch {
            channel,
            expected: total_len,
            actual: usize::try_from(expanded).unwrap_or(usize::MAX),
        });
    }

    let mut buffer = Vec::with_capacity(total_len);
    for run in runs {
        buffer.resize(buffer.len() + run.count as usize, run.value);
    }
    Ok(buffer)
}

/// Flatten runs into `[value, count, value, count, ...]`.
pub fn runs_to_flat<T: ChannelValue>(runs: &[Run<T>]) -> Vec<u32> {
    let mut flat = Vec::with_capacity(runs.len() * 2);
    for run in runs {
        flat.push(run.value.into());
        flat.push(run.count);
    }
    flat
}

/// Parse a flat `[value, count, ...]` list back into runs.
pub fn runs_from_flat<T: ChannelValue>(flat: &[u32], channel: &'static str) -> Result<Vec<Run<T>>> {
    if flat.len() % 2 != 0 {
        return Err(MaskError::MalformedRuns {
            channel,
            reason: format!("odd number of entries ({})", flat.len()),
        });
    }
    flat.chunks_exact(2)
        .map(|pair| {
            let value = T::try_from(pair[0]).map_err(|_| MaskError::MalformedRuns {
                channel,
                reason: format!("value {} does not fit the channel", pair[0]),
            })?;
            Ok(Run { value, count: pair[1] })
        })
        .collect()
}

/// Encode unsigned integers into the COCO LEB128-like character format.
///
/// Each number is split into 5-bit groups, least significant first; bit 5
/// of a group marks a continuation and every group is offset by 48 into
/// printable ASCII. The top bit of the final group acts as a sign bit, so
/// a value whose last group would set it gets one extra zero group.
pub fn encode_counts(values: &[u32]) -> String {
    let mut s = String::with_capacity(values.len() * 2);
    for &v in values {
        let mut x = v as i64;
        loop {
            let mut c = (x & 0x1f) as u8;
            x >>= 5;
            let more = if c & 0x10 != 0 { x != -1 } else { x != 0 };
            if more {
                c |= 0x20;
            }
            s.push((c + 48) as char);
            if !more {
                break;
            }
        }
    }
    s
}

/// Decode a string produced by [`encode_counts`].
pub fn decode_counts(s: &str) -> Result<Vec<u32>> {
    let bytes = s.as_bytes();
    let mut values = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let mut x: i64 = 0;
        let mut shift = 0;
        let mut more = true;
        while more {
            let Some(&b) = bytes.get(i) else {
                return Err(MaskError::MalformedBlob(
                    "count sequence ends mid-value".into(),
                ));
            };
            if !(48..48 + 64).contains(&b) {
                return Err(MaskError::MalformedBlob(format!(
                    "unexpected character {:?} at offset {i}",
                    b as char
                )));
            }
            if shift > 35 {
                return Err(MaskError::MalformedBlob(format!(
                    "value at offset {i} exceeds 32 bits"
                )));
            }
            let c = (b - 48) as i64;
            i += 1;
            x |= (c & 0x1f) << shift;
            more = (c & 0x20) != 0;
            shift += 5;
        }
        // Sign extend from the top bit of the last group.
        if x & (1 << (shift - 1)) != 0 {
            x |= !0i64 << shift;
        }
        let v = u32::try_from(x).map_err(|_| {
            MaskError::MalformedBlob(format!("decoded value {x} is not an unsigned 32-bit count"))
        })?;
        values.push(v);
    }
    Ok(values)
}

/// Layout of the `compressedMask` blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecVersion {
    /// Base64 JSON of flat run lists, written by older editors.
    Legacy,
    /// Character-encoded run lists joined by `|`.
    #[default]
    Packed,
}

impl CodecVersion {
    pub const CURRENT: CodecVersion = CodecVersion::Packed;

    pub fn number(self) -> u32 {
        match self {
            CodecVersion::Legacy => 1,
            CodecVersion::Packed => 2,
        }
    }

    pub fn from_number(n: u32) -> Result<Self> {
        match n {
            1 => Ok(CodecVersion::Legacy),
            2 => Ok(CodecVersion::Packed),
            other => Err(MaskError::UnsupportedCodecVersion(other)),
        }
    }

    /// Resolve a payload's `codecVersion` field; absent means legacy.
    pub fn of_payload(field: Option<u32>) -> Result<Self> {
        field.map_or(Ok(CodecVersion::Legacy), Self::from_number)
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct LegacyChannels {
    instance_id: Vec<u32>,
    class_id: Vec<u32>,
    confidence: Vec<u32>,
}

/// Compress the three raw channels into one text blob.
pub fn encode_mask_blob(raw: &RawMasks, version: CodecVersion) -> Result<String> {
    let instance = runs_to_flat(&compress(&raw.instance_id));
    let class = runs_to_flat(&compress(&raw.class_id));
    let confidence = runs_to_flat(&compress(&raw.confidence));

    match version {
        CodecVersion::Legacy => {
            let json = serde_json::to_vec(&LegacyChannels {
                instance_id: instance,
                class_id: class,
                confidence,
            })?;
            Ok(STANDARD.encode(json))
        }
        CodecVersion::Packed => {
            let segments = [
                encode_counts(&instance),
                encode_counts(&class),
                encode_counts(&confidence),
            ];
            Ok(segments.join(&SEGMENT_SEPARATOR.to_string()))
        }
    }
}

/// Expand a text blob into three channels of `total_len` pixels each.
pub fn decode_mask_blob(blob: &str, version: CodecVersion, total_len: usize) -> Result<RawMasks> {
    let (instance, class, confidence) = match version {
        CodecVersion::Legacy => {
            let json = STANDARD.decode(blob.trim())?;
            let channels: LegacyChannels = serde_json::from_slice(&json)?;
            (channels.instance_id, channels.class_id, channels.confidence)
        }
        CodecVersion::Packed => {
            let segments: Vec<&str> = blob.split(SEGMENT_SEPARATOR).collect();
            let [instance, class, confidence] = segments[..] else {
                return Err(MaskError::MalformedBlob(format!(
                    "expected 3 channel segments, found {}",
                    segments.len()
                )));
            };
            (
                decode_counts(instance)?,
                decode_counts(class)?,
                decode_counts(confidence)?,
            )
        }
    };

    Ok(RawMasks {
        instance_id: decompress(
            &runs_from_flat(&instance, INSTANCE_CHANNEL)?,
            total_len,
            INSTANCE_CHANNEL,
        )?,
        class_id: decompress(&runs_from_flat(&class, CLASS_CHANNEL)?, total_len, CLASS_CHANNEL)?,
        confidence: decompress(
            &runs_from_flat(&confidence, CONFIDENCE_CHANNEL)?,
            total_len,
            CONFIDENCE_CHANNEL,
        )?,
    })
}
