use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use iss_mask::{
    build_payload_from_live_instances, instances_from_payload, CodecVersion, FrameContext,
    LiveInstance, MaskParams, MaskQuery, UnifiedMaskPayload,
};

#[derive(Parser)]
#[command(name = "iss-mask")]
#[command(about = "Build, inspect and restore unified instance-segmentation masks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a unified payload from a frame of live polygon instances
    Build {
        /// Frame JSON: {imageId, width, height, instances: [...]}
        #[arg(long)]
        frame: PathBuf,

        /// Payload previously saved for this frame, keeps instance ids stable
        #[arg(long)]
        previous: Option<PathBuf>,

        /// Output path (stdout if omitted)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Blob layout: 1 (legacy base64 JSON) or 2 (packed)
        #[arg(long, default_value_t = CodecVersion::CURRENT.number())]
        codec_version: u32,
    },
    /// Summarize a payload and optionally look up one pixel
    Inspect {
        #[arg(long)]
        payload: PathBuf,

        /// Pixel to query as "x,y"
        #[arg(long, value_delimiter = ',', num_args = 2)]
        pixel: Option<Vec<u32>>,
    },
    /// Turn a payload back into editor polygon instances
    Restore {
        #[arg(long)]
        payload: PathBuf,

        /// Object id synthetic track ids are derived from
        #[arg(long)]
        base_track_id: Option<String>,
    },
}

#[derive(Deserialize)]
struct FrameFile {
    #[serde(flatten)]
    frame: FrameContext,
    instances: Vec<LiveInstance>,
}

fn read_payload(path: &Path) -> Result<UnifiedMaskPayload, Box<dyn std::error::Error>> {
    info!("Loading payload from {:?}", path);
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn write_json<T: serde::Serialize>(
    value: &T,
    out: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => {
            fs::write(path, json)?;
            info!("Wrote {:?}", path);
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Build {
            frame,
            previous,
            out,
            codec_version,
        } => {
            let params = MaskParams {
                codec_version: CodecVersion::from_number(codec_version)?,
                ..MaskParams::new()
            };

            info!("Loading frame from {:?}", frame);
            let text = fs::read_to_string(&frame)?;
            let frame: FrameFile = serde_json::from_str(&text)?;
            let previous = previous.as_deref().map(read_payload).transpose()?;

            let payload = build_payload_from_live_instances(
                &frame.frame,
                &frame.instances,
                previous.as_ref(),
                &params,
            )?;
            info!(
                "Built payload for {} with {} instances, {} annotated pixels",
                payload.image_id, payload.metadata.total_instances, payload.metadata.annotated_pixels
            );
            write_json(&payload, out.as_deref())?;
        }
        Command::Inspect { payload, pixel } => {
            let payload = read_payload(&payload)?;
            payload.validate()?;

            let mut query = MaskQuery::new(&payload);
            let dims = payload.image_dimensions;
            println!("image:      {}", payload.image_id);
            println!("size:       {}x{}", dims.width, dims.height);
            println!(
                "codec:      {}",
                CodecVersion::of_payload(payload.codec_version)?.number()
            );
            println!("instances:  {}", payload.metadata.total_instances);
            println!(
                "annotated:  {} / {} pixels",
                query.annotated_pixels()?,
                dims.total_pixels()
            );
            for inst in payload.instances.values() {
                let pixels = query.get_instance_pixels(inst.id)?.len();
                let identity = payload
                    .tracking_for(inst.id)
                    .map(|record| record.original_identity.as_str())
                    .unwrap_or("-");
                println!(
                    "  #{:<5} class={:<3} {:<16} conf={:.3} pixels={:<8} identity={}",
                    inst.id, inst.class_id, inst.class_name, inst.confidence, pixels, identity
                );
            }

            if let Some(xy) = pixel {
                let (x, y) = (xy[0], xy[1]);
                match query.get_pixel_info(x, y)? {
                    Some(info) => println!("pixel ({x},{y}): {}", serde_json::to_string(&info)?),
                    None => println!("pixel ({x},{y}): outside image"),
                }
            }
        }
        Command::Restore {
            payload,
            base_track_id,
        } => {
            let payload = read_payload(&payload)?;
            let restored = instances_from_payload(&payload, base_track_id.as_deref());
            info!("Restored {} instances", restored.len());
            write_json(&restored, None)?;
        }
    }

    Ok(())
}
