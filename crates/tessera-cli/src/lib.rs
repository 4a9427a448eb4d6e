//! # Tessera CLI
//!
//! Command-line driver for the tile streaming engine.
//!
//! ## Commands
//! - `simulate` - Stream tiles for a camera sweeping across tiled textures
//! - `config` - Print a per-frame configuration as JSON

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tessera_core::{FrameClock, TileLayout, TiledTextureDesc, FEEDBACK_NOT_SAMPLED};
use tessera_feedback::{
    FeedbackData, FeedbackManager, FeedbackManagerDesc, FeedbackManagerStats, FeedbackUpdateConfig,
    FrameEvents, HeapBackend,
};

/// Frame duration of the simulated clock
const FRAME_SECONDS: f64 = 1.0 / 60.0;

/// Tessera tile streaming CLI
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Simulate a camera sweep and print the final statistics
    Simulate {
        /// Number of tiled textures
        #[arg(short, long, default_value = "4")]
        textures: u32,

        /// Texture width and height in texels
        #[arg(short, long, default_value = "4096")]
        size: u32,

        /// Frames to simulate
        #[arg(short, long, default_value = "600")]
        frames: u64,

        /// Frames between resolving and consuming feedback
        #[arg(long, default_value = "2")]
        frames_in_flight: u32,

        /// Tile slots per heap
        #[arg(long, default_value = "256")]
        heap_size: u32,

        /// Heaps the simulated device can create
        #[arg(long)]
        max_heaps: Option<u32>,

        /// Group every texture behind the first one into a texture set
        #[arg(long)]
        texture_set: bool,

        /// Frame at which a camera cut happens
        #[arg(long)]
        camera_cut: Option<u64>,

        /// JSON file with the per-frame configuration
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print a per-frame configuration as JSON
    Config {
        /// Print the legacy preset
        #[arg(long)]
        legacy: bool,
    },
}

/// Parameters of a simulation run
#[derive(Debug, Clone)]
pub struct SimulationParams {
    pub textures: u32,
    pub size: u32,
    pub frames: u64,
    pub camera_cut: Option<u64>,
    pub texture_set: bool,
    pub max_heaps: Option<u32>,
    pub desc: FeedbackManagerDesc,
    pub config: FeedbackUpdateConfig,
}

/// Heap backend standing in for a device, optionally capped
#[derive(Debug, Default)]
pub struct SimulatedHeapBackend {
    live: u32,
    created: u32,
    max_heaps: Option<u32>,
}

impl SimulatedHeapBackend {
    pub fn with_limit(max_heaps: Option<u32>) -> Self {
        Self { max_heaps, ..Default::default() }
    }

    pub fn live_heaps(&self) -> u32 {
        self.live
    }
}

impl HeapBackend for SimulatedHeapBackend {
    type Heap = u32;
    type Error = String;

    fn create_heap(&mut self, size_in_bytes: u64) -> Result<u32, String> {
        if self.max_heaps.is_some_and(|max| self.live >= max) {
            return Err(format!("device refused a {} byte heap", size_in_bytes));
        }
        self.live += 1;
        self.created += 1;
        Ok(self.created)
    }

    fn destroy_heap(&mut self, _heap: u32) {
        self.live -= 1;
    }
}

/// MinMip feedback of a camera sweeping left to right over a texture
///
/// Regions near the camera sample mip 0, coarser further away; regions more
/// than a quarter of the texture away are not sampled.
pub fn sweep_feedback(layout: &TileLayout, frame: u64, period: u64) -> Vec<u8> {
    let (width, height) = layout.feedback_grid();
    let period = period.max(1);
    let center = (frame % period) as f32 / period as f32 * width as f32;
    let visible = (width as f32 / 4.0).max(1.0);
    let coarsest = layout.desc().regular_mip_levels.saturating_sub(1);

    let mut data = Vec::with_capacity((width * height) as usize);
    for _y in 0..height {
        for x in 0..width {
            let distance = (x as f32 + 0.5 - center).abs();
            if distance >= visible {
                data.push(FEEDBACK_NOT_SAMPLED);
            } else {
                let mip = (distance / visible * coarsest as f32) as u32;
                data.push(mip.min(coarsest) as u8);
            }
        }
    }
    data
}

/// Run a simulation and return the statistics of the last frame
pub fn simulate(params: &SimulationParams) -> Result<FeedbackManagerStats> {
    let backend = SimulatedHeapBackend::with_limit(params.max_heaps);
    let mut manager = FeedbackManager::with_clock(params.desc.clone(), backend, FrameClock::manual())?;

    let mut textures = Vec::with_capacity(params.textures as usize);
    for _ in 0..params.textures {
        let desc = TiledTextureDesc::with_full_mip_chain(params.size, params.size, 128, 128);
        textures.push(manager.create_texture(desc)?);
    }
    if params.texture_set && textures.len() > 1 {
        manager.create_texture_set(&textures)?;
    }

    let period = (params.frames / 2).max(1);
    for frame in 0..params.frames {
        manager.clock_mut().advance(FRAME_SECONDS);

        let mut config = params.config.clone().with_frame_index(frame);
        if params.camera_cut == Some(frame) {
            config.events |= FrameEvents::CAMERA_CUT;
        }

        let update = manager.begin_frame(&config)?;
        manager.update_tile_mappings(&update.tiles_to_map)?;
        manager.complete_defrag_moves(&update.defrag_moves)?;

        for &texture in &update.textures_to_resolve {
            let data = sweep_feedback(manager.residency().layout(texture)?, frame, period);
            manager.resolve_feedback(texture, FeedbackData::MinMip(data))?;
        }
        manager.end_frame();

        if frame % 60 == 0 {
            let stats = manager.stats();
            log::debug!(
                "frame {}: {} heaps, {} mapped, {} standby, {} requested",
                frame,
                stats.heap_count,
                stats.tiles_mapped,
                stats.tiles_standby,
                stats.tiles_requested
            );
        }
    }

    Ok(manager.stats())
}

fn load_config(path: Option<PathBuf>) -> Result<FeedbackUpdateConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(FeedbackUpdateConfig::default()),
    }
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cli.command {
        Commands::Simulate {
            textures,
            size,
            frames,
            frames_in_flight,
            heap_size,
            max_heaps,
            texture_set,
            camera_cut,
            config,
        } => {
            let params = SimulationParams {
                textures,
                size,
                frames,
                camera_cut,
                texture_set,
                max_heaps,
                desc: FeedbackManagerDesc {
                    num_frames_in_flight: frames_in_flight,
                    heap_size_in_tiles: heap_size,
                    ..Default::default()
                },
                config: load_config(config)?,
            };
            log::info!("Simulating {} frames over {} textures of {}x{}", frames, textures, size, size);
            let stats = simulate(&params)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Config { legacy } => {
            let config = if legacy { FeedbackUpdateConfig::legacy() } else { FeedbackUpdateConfig::default() };
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
