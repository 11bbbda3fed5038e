//! # Tilestream CLI
//!
//! Command-line interface for the tilestream residency engine.
//!
//! ## Commands
//! - `inspect` - Print the page table geometry of a virtual texture
//! - `simulate` - Stream a virtual texture under a moving viewport
//! - `config` - Print the default streaming configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use glam::UVec2;
use serde::Serialize;
use tilestream_texture::{
    CheckerboardGenerator, LodMode, ResidencyStats, SoftwareDevice, StreamingConfig,
    VirtualTexture, VirtualTextureDescriptor,
};

/// Tilestream virtual texture CLI
#[derive(Parser)]
#[command(name = "tilestream")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Print the page table geometry of a virtual texture
    Inspect {
        /// Virtual width in texels
        #[arg(long, default_value = "4096")]
        width: u32,

        /// Virtual height in texels
        #[arg(long, default_value = "4096")]
        height: u32,

        /// Streaming configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Stream a virtual texture under a moving viewport
    Simulate {
        /// Virtual width in texels
        #[arg(long, default_value = "4096")]
        width: u32,

        /// Virtual height in texels
        #[arg(long, default_value = "4096")]
        height: u32,

        /// Number of frames to run
        #[arg(short, long, default_value = "32")]
        frames: u32,

        /// Feedback latency in frames (overrides the config file)
        #[arg(short, long)]
        latency: Option<u32>,

        /// Mip level the viewport samples
        #[arg(short, long, default_value = "0")]
        mip: u32,

        /// Viewport size in tiles
        #[arg(short, long, default_value = "4")]
        window: u32,

        /// Use the legacy whole-mip mode
        #[arg(long)]
        whole_mip: bool,

        /// Streaming configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the default streaming configuration
    Config,
}

/// Geometry summary of one mip level
#[derive(Debug, Clone, Serialize)]
pub struct MipSummary {
    pub mip: u32,
    pub width: u32,
    pub height: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
    pub pages: usize,
    pub packed: bool,
    pub heap_range: u32,
}

/// Result of `inspect`
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub mip_count: u32,
    pub packed_mip_count: u32,
    pub page_count: usize,
    pub heap_tiles: u32,
    pub mips: Vec<MipSummary>,
}

/// Result of `simulate`
#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub frames: u32,
    pub resident_pages: usize,
    pub staging_blocks_in_use: usize,
    pub device_commands: u64,
    pub device_faults: u64,
    pub stats: ResidencyStats,
}

/// Load a configuration file, or the defaults when no path is given
pub fn load_config(path: Option<&Path>) -> Result<StreamingConfig> {
    let Some(path) = path else {
        return Ok(StreamingConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    Ok(config)
}

/// Describe the page table of a `width` x `height` virtual texture
pub fn inspect(width: u32, height: u32, config: &StreamingConfig) -> Result<InspectReport> {
    let device = SoftwareDevice::new();
    let desc = VirtualTextureDescriptor::from_device(&device, width, height, config.format)?;
    let table = desc.page_table();

    let mips = table
        .mips()
        .iter()
        .enumerate()
        .map(|(mip, info)| MipSummary {
            mip: mip as u32,
            width: info.extent.x,
            height: info.extent.y,
            tiles_x: info.tiles.x,
            tiles_y: info.tiles.y,
            pages: info.pages.len(),
            packed: info.is_packed,
            heap_range: info.heap_range_index,
        })
        .collect();

    Ok(InspectReport {
        width,
        height,
        tile_width: desc.tile_width(),
        tile_height: desc.tile_height(),
        mip_count: desc.mip_count(),
        packed_mip_count: desc.packed_mip_count(),
        page_count: table.len(),
        heap_tiles: desc.heap_layout().capacity_tiles(),
        mips,
    })
}

/// Pages covered by a `window`-tile square that slides one tile per frame
pub fn viewport_pages(
    desc: &VirtualTextureDescriptor,
    mip: u32,
    window: u32,
    frame: u32,
) -> Vec<usize> {
    let table = desc.page_table();
    let Some(info) = table.mip(mip) else {
        return Vec::new();
    };
    if info.is_packed {
        return table.packed_page_index().into_iter().collect();
    }

    let size = UVec2::splat(window.max(1)).min(info.tiles);
    let travel = info.tiles - size + UVec2::ONE;
    let origin = UVec2::new(frame % travel.x, (frame / 2) % travel.y);

    let mut pages = Vec::with_capacity((size.x * size.y) as usize);
    for y in origin.y..origin.y + size.y {
        for x in origin.x..origin.x + size.x {
            if let Some(index) = table.page_index_at(mip, x, y) {
                pages.push(index);
            }
        }
    }
    pages
}

/// Run `frames` updates, marking the viewport's pages visible each frame
pub fn simulate(
    width: u32,
    height: u32,
    frames: u32,
    mip: u32,
    window: u32,
    config: StreamingConfig,
) -> Result<SimulationSummary> {
    let device = Arc::new(SoftwareDevice::new());
    let whole_mip = config.lod_mode == LodMode::WholeMip;
    let mut texture = VirtualTexture::new(
        width,
        height,
        config,
        device.clone(),
        Arc::new(CheckerboardGenerator),
    )?;

    if mip >= texture.descriptor().mip_count() {
        bail!(
            "Mip {} out of range, texture has {} mips",
            mip,
            texture.descriptor().mip_count()
        );
    }
    if whole_mip {
        while texture.descriptor().active_mip() > mip {
            texture.level_down();
        }
    }

    for frame in 0..frames {
        for page in viewport_pages(texture.descriptor(), mip, window, frame) {
            texture.visibility_buffer().mark(page);
        }
        let report = texture
            .update()
            .with_context(|| format!("Residency update failed on frame {}", frame))?;
        log::debug!(
            "Frame {}: alive {} dead {} added {} removed {}",
            report.frame,
            report.alive,
            report.dead,
            report.added,
            report.removed
        );
    }

    let table = texture.descriptor().page_table();
    Ok(SimulationSummary {
        frames,
        resident_pages: table.count_in_state(tilestream_texture::ResidencyState::Resident),
        staging_blocks_in_use: texture.residency().staging().outstanding_blocks(),
        device_commands: device.command_count(),
        device_faults: device.fault_count(),
        stats: *texture.residency().stats(),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cli.command {
        Commands::Inspect {
            width,
            height,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            let report = inspect(width, height, &config)?;
            if cli.json {
                return print_json(&report);
            }

            log::info!("Virtual texture {}x{} ({:?})", width, height, config.format);
            log::info!("  Tile: {}x{}", report.tile_width, report.tile_height);
            log::info!(
                "  Mips: {} ({} packed)",
                report.mip_count,
                report.packed_mip_count
            );
            log::info!("  Pages: {}", report.page_count);
            log::info!("  Heap tiles: {}", report.heap_tiles);
            for mip in &report.mips {
                log::info!(
                    "  mip {:>2}: {}x{} {}x{} tiles, {} pages{}",
                    mip.mip,
                    mip.width,
                    mip.height,
                    mip.tiles_x,
                    mip.tiles_y,
                    mip.pages,
                    if mip.packed { " (packed)" } else { "" }
                );
            }
        }

        Commands::Simulate {
            width,
            height,
            frames,
            latency,
            mip,
            window,
            whole_mip,
            config,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(latency) = latency {
                config.feedback_latency = latency;
            }
            if whole_mip {
                config.lod_mode = LodMode::WholeMip;
            }

            log::info!("Simulating {} frames on a {}x{} texture...", frames, width, height);
            let summary = simulate(width, height, frames, mip, window, config)?;
            if cli.json {
                return print_json(&summary);
            }

            log::info!("  Resident pages: {}", summary.resident_pages);
            log::info!("  Staging blocks in use: {}", summary.staging_blocks_in_use);
            log::info!("  Pages added: {}", summary.stats.pages_added);
            log::info!("  Pages removed: {}", summary.stats.pages_removed);
            log::info!("  Deferred: {}", summary.stats.deferred);
            log::info!("  Device commands: {}", summary.device_commands);
            if summary.device_faults > 0 {
                log::warn!("  Device faults: {}", summary.device_faults);
            }
            log::info!("Simulation complete!");
        }

        Commands::Config => print_json(&StreamingConfig::default())?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse() {
        let cli = Cli::parse_from(["tilestream", "inspect"]);
        assert!(matches!(
            cli.command,
            Commands::Inspect {
                width: 4096,
                height: 4096,
                ..
            }
        ));
    }

    #[test]
    fn test_simulate_command() {
        let cli = Cli::parse_from([
            "tilestream",
            "simulate",
            "--width",
            "1024",
            "-f",
            "8",
            "-l",
            "1",
            "--whole-mip",
            "--json",
        ]);
        assert!(cli.json);
        if let Commands::Simulate {
            width,
            frames,
            latency,
            whole_mip,
            ..
        } = cli.command
        {
            assert_eq!(width, 1024);
            assert_eq!(frames, 8);
            assert_eq!(latency, Some(1));
            assert!(whole_mip);
        } else {
            panic!("Expected Simulate command");
        }
    }

    #[test]
    fn test_inspect_report() {
        let report = inspect(4096, 4096, &StreamingConfig::default()).unwrap();
        assert_eq!(report.mip_count, 13);
        assert_eq!(report.packed_mip_count, 7);
        assert_eq!(report.page_count, 1366);
        assert_eq!(report.mips[0].pages, 1024);
        assert!(report.mips[12].packed);
    }

    #[test]
    fn test_viewport_stays_inside_grid() {
        let device = SoftwareDevice::new();
        let desc = VirtualTextureDescriptor::from_device(
            &device,
            1024,
            1024,
            tilestream_texture::PixelFormat::Rgba8Unorm,
        )
        .unwrap();

        for frame in 0..20 {
            let pages = viewport_pages(&desc, 0, 4, frame);
            assert_eq!(pages.len(), 16);
            assert!(pages.iter().all(|&p| desc.page_table().pages_in_mip(0).contains(&p)));
        }
        assert_eq!(
            viewport_pages(&desc, 10, 4, 0),
            vec![desc.page_table().packed_page_index().unwrap()]
        );
    }

    #[test]
    fn test_simulation_streams_pages() {
        let config = StreamingConfig {
            feedback_latency: 1,
            staging_capacity_pages: 64,
            ..StreamingConfig::default()
        };
        let summary = simulate(1024, 1024, 6, 0, 2, config).unwrap();

        assert!(summary.stats.pages_added > 0);
        // Viewport pages plus the pinned aggregate
        assert!(summary.resident_pages <= 4 + 1);
        assert_eq!(summary.staging_blocks_in_use, summary.resident_pages);
        assert_eq!(summary.device_faults, 0);
    }

    #[test]
    fn test_simulation_rejects_bad_mip() {
        assert!(simulate(256, 256, 1, 40, 2, StreamingConfig::default()).is_err());
    }

    #[test]
    fn test_load_config_file() {
        let path = std::env::temp_dir()
            .join(format!("tilestream-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "feedback_latency": 3, "pin_packed_mips": false }"#).unwrap();

        let config = load_config(Some(path.as_path())).unwrap();
        assert_eq!(config.feedback_latency, 3);
        assert!(!config.pin_packed_mips);
        assert_eq!(config.staging_capacity_pages, 512);

        std::fs::remove_file(&path).unwrap();
        assert!(load_config(Some(path.as_path())).is_err());
        assert_eq!(load_config(None).unwrap(), StreamingConfig::default());
    }
}
