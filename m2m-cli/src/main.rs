//! `m2m` CLI entrypoint.
//!
//! ```bash
//! m2m probe --device /dev/video10 --json
//! m2m probe --device /dev/video10 --config decoder.json
//! m2m validate --config decoder.json --json
//! m2m formats
//! ```

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use m2m_core::config::DecoderConfig;
use m2m_core::error::{EngineError, Result};
use m2m_core::types::{PixelFormat, Rect, VideoCodec};
use m2m_pipeline::needs_conversion;
use m2m_v4l2::device::{DeviceControl, DeviceRole, V4l2Device};
use m2m_v4l2::queue::{Direction, QueueFormat};

#[derive(Parser, Debug)]
#[command(
    name = "m2m",
    version,
    about = "V4L2 mem2mem decoder tool",
    arg_required_else_help = true,
    after_help = "Examples:\n  m2m probe --device /dev/video10 --json\n  m2m validate --config decoder.json\n  m2m formats --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a device node and report its capabilities and current formats.
    Probe(ProbeArgs),
    /// Load and validate a decoder config file.
    Validate(ValidateArgs),
    /// List the pixel formats and codecs the decoder understands.
    Formats(FormatsArgs),
}

#[derive(Args, Debug)]
struct ProbeArgs {
    /// Decoder device node.
    #[arg(short = 'd', long = "device")]
    device: PathBuf,

    /// Decoder config; reports whether its output format needs conversion.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Emit machine-readable JSON to stdout.
    #[arg(long = "json")]
    json: bool,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    /// Decoder config file (JSON).
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Emit machine-readable JSON to stdout.
    #[arg(long = "json")]
    json: bool,
}

#[derive(Args, Debug)]
struct FormatsArgs {
    /// Emit machine-readable JSON to stdout.
    #[arg(long = "json")]
    json: bool,
}

const JSON_SCHEMA_VERSION: u32 = 1;

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Probe(args) if args.json => Some("probe"),
        Commands::Validate(args) if args.json => Some("validate"),
        Commands::Formats(args) if args.json => Some("formats"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Probe(args) => run_probe(args),
        Commands::Validate(args) => run_validate(args),
        Commands::Formats(args) => run_formats(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

// ─── JSON envelope ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    schema_version: u32,
    command: &'static str,
    ok: bool,
    #[serde(flatten)]
    body: T,
}

fn to_json<T: Serialize>(command: &'static str, body: T) -> Result<String> {
    serde_json::to_string(&Envelope {
        schema_version: JSON_SCHEMA_VERSION,
        command,
        ok: true,
        body,
    })
    .map_err(|err| EngineError::InvariantViolation(format!("JSON encoding failed: {err}")))
}

fn command_error_json(command: &str, err: &EngineError) -> String {
    serde_json::json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "error": err.to_string(),
        "error_code": err.error_code(),
    })
    .to_string()
}

// ─── probe ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct FormatReport {
    width: u32,
    height: u32,
    fourcc: String,
    pixel_format: PixelFormat,
    planes: usize,
}

impl From<&QueueFormat> for FormatReport {
    fn from(format: &QueueFormat) -> Self {
        Self {
            width: format.size.width,
            height: format.size.height,
            fourcc: format.fourcc.to_string(),
            pixel_format: PixelFormat::from_fourcc(format.fourcc),
            planes: format.planes.len(),
        }
    }
}

#[derive(Serialize)]
struct ProbeReport {
    device: String,
    driver: String,
    card: String,
    bus_info: String,
    multiplanar: bool,
    source_change_events: bool,
    output_format: Option<FormatReport>,
    capture_format: Option<FormatReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    needs_conversion: Option<bool>,
}

fn query_or_warn(device: &V4l2Device, direction: Direction) -> Option<QueueFormat> {
    match device.query_format(direction) {
        Ok(format) => Some(format),
        Err(err) => {
            tracing::warn!(queue = direction.label(), error = %err, "Format query failed");
            None
        }
    }
}

fn run_probe(args: ProbeArgs) -> Result<()> {
    let config = args
        .config
        .as_deref()
        .map(DecoderConfig::from_json_file)
        .transpose()?;

    let mut device = V4l2Device::new(&args.device, DeviceRole::Decoder);
    device.open()?;
    let caps = device.capabilities().cloned().ok_or_else(|| {
        EngineError::InvariantViolation("device opened without capabilities".into())
    })?;

    let source_change_events = match device.subscribe_source_change() {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "Source-change events unsupported");
            false
        }
    };
    let output = query_or_warn(&device, Direction::Output);
    let capture = query_or_warn(&device, Direction::Capture);
    let conversion = match (&config, &capture) {
        (Some(config), Some(capture)) => Some(needs_conversion(
            PixelFormat::from_fourcc(capture.fourcc),
            config.output_format,
        )),
        _ => None,
    };

    let report = ProbeReport {
        device: device.path().display().to_string(),
        driver: caps.driver,
        card: caps.card,
        bus_info: caps.bus_info,
        multiplanar: caps.multiplanar,
        source_change_events,
        output_format: output.as_ref().map(FormatReport::from),
        capture_format: capture.as_ref().map(FormatReport::from),
        needs_conversion: conversion,
    };

    if args.json {
        println!("{}", to_json("probe", &report)?);
        return Ok(());
    }

    println!("probe: {}", report.device);
    println!(
        "driver={} card={} bus={} multiplanar={} source_change_events={}",
        report.driver,
        report.card,
        report.bus_info,
        report.multiplanar,
        report.source_change_events
    );
    for (label, format) in [("output", &output), ("capture", &capture)] {
        match format {
            Some(f) => println!(
                "{label}: {} {} ({})",
                f.size,
                f.fourcc,
                PixelFormat::from_fourcc(f.fourcc)
            ),
            None => println!("{label}: unavailable"),
        }
    }
    if let Some(conversion) = report.needs_conversion {
        println!("needs_conversion={conversion}");
    }
    Ok(())
}

// ─── validate ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ValidateReport<'a> {
    config: String,
    codec: VideoCodec,
    bitstream_filter: Option<&'static str>,
    coded_size: Option<Rect>,
    output_format: PixelFormat,
    opaque_output: bool,
    num_capture_buffers: u32,
    num_output_buffers: u32,
    decoder_device: Option<&'a PathBuf>,
    converter_device: Option<&'a PathBuf>,
}

fn run_validate(args: ValidateArgs) -> Result<()> {
    let config = DecoderConfig::from_json_file(&args.config)?;
    config.validate()?;

    let report = ValidateReport {
        config: args.config.display().to_string(),
        codec: config.codec,
        bitstream_filter: config.codec.bitstream_filter(),
        coded_size: config.coded_size,
        output_format: config.output_format,
        opaque_output: config.opaque_output,
        num_capture_buffers: config.num_capture_buffers,
        num_output_buffers: config.num_output_buffers,
        decoder_device: config.decoder_device.as_ref(),
        converter_device: config.converter_device.as_ref(),
    };

    if args.json {
        println!("{}", to_json("validate", &report)?);
    } else {
        let coded = config
            .coded_size
            .map_or_else(|| "from-stream".to_string(), |size| size.to_string());
        println!(
            "validate: ok codec={} coded={coded} output_format={} capture_buffers={} output_buffers={}",
            config.codec.name(),
            config.output_format,
            config.num_capture_buffers,
            config.num_output_buffers
        );
    }
    Ok(())
}

// ─── formats ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct FormatEntry {
    format: PixelFormat,
    fourcc: String,
}

#[derive(Serialize)]
struct CodecEntry {
    codec: VideoCodec,
    fourcc: String,
    bitstream_filter: Option<&'static str>,
}

#[derive(Serialize)]
struct FormatsReport {
    formats: Vec<FormatEntry>,
    codecs: Vec<CodecEntry>,
}

fn run_formats(args: FormatsArgs) -> Result<()> {
    let report = FormatsReport {
        formats: PixelFormat::table()
            .iter()
            .map(|(format, fourcc)| FormatEntry {
                format: *format,
                fourcc: fourcc.to_string(),
            })
            .collect(),
        codecs: VideoCodec::ALL
            .iter()
            .map(|codec| CodecEntry {
                codec: *codec,
                fourcc: codec.fourcc().to_string(),
                bitstream_filter: codec.bitstream_filter(),
            })
            .collect(),
    };

    if args.json {
        println!("{}", to_json("formats", &report)?);
        return Ok(());
    }

    println!("pixel formats:");
    for entry in &report.formats {
        println!("  {:<10} {}", entry.format.name(), entry.fourcc);
    }
    println!("codecs:");
    for entry in &report.codecs {
        println!(
            "  {:<10} {} {}",
            entry.codec.name(),
            entry.fourcc,
            entry.bitstream_filter.unwrap_or("-")
        );
    }
    Ok(())
}
