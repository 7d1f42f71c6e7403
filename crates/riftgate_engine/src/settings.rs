use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PortalError;

const MIN_SYNC_FREQUENCY: f32 = 1.0;
const MAX_SYNC_FREQUENCY: f32 = 240.0;
const MIN_RECURSION_DEPTH: u32 = 1;
const MAX_RECURSION_DEPTH: u32 = 8;
const MIN_CLIPPING_QUALITY: u8 = 0;
const MAX_CLIPPING_QUALITY: u8 = 3;
const MIN_VISIBILITY_THRESHOLD: f32 = 0.0;
const MAX_VISIBILITY_THRESHOLD: f32 = 1.0;

/// Engine tuning, loadable from a toml file by hosts that want it on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Ghost snapshot sync rate, Hz. Batch groups run at half this rate.
    #[serde(default = "default_ghost_sync_frequency")]
    pub ghost_sync_frequency: f32,
    /// Logical entity merge/sync rate, Hz.
    #[serde(default = "default_logical_update_frequency")]
    pub logical_update_frequency: f32,
    /// Route chain physics through unified logical entities.
    #[serde(default = "default_use_logical_entity_control")]
    pub use_logical_entity_control: bool,
    #[serde(default = "default_max_recursion_depth")]
    pub default_max_recursion_depth: u32,
    /// Migrate the main role automatically when a center crosses a plane.
    #[serde(default = "default_auto_swap_on_center_cross")]
    pub auto_swap_on_center_cross: bool,
    #[serde(default = "default_max_concurrent_teleports")]
    pub max_concurrent_teleports: usize,
    /// 0 = cheapest single-plane clipping, 3 = full stencil pipeline.
    #[serde(default = "default_clipping_quality")]
    pub clipping_quality: u8,
    /// Segments dimmer than this are culled.
    #[serde(default = "default_min_segment_visibility")]
    pub min_segment_visibility: f32,
    #[serde(default = "default_smooth_transition_blend_distance")]
    pub smooth_transition_blend_distance: f32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ghost_sync_frequency: default_ghost_sync_frequency(),
            logical_update_frequency: default_logical_update_frequency(),
            use_logical_entity_control: default_use_logical_entity_control(),
            default_max_recursion_depth: default_max_recursion_depth(),
            auto_swap_on_center_cross: default_auto_swap_on_center_cross(),
            max_concurrent_teleports: default_max_concurrent_teleports(),
            clipping_quality: default_clipping_quality(),
            min_segment_visibility: default_min_segment_visibility(),
            smooth_transition_blend_distance: default_smooth_transition_blend_distance(),
        }
    }
}

impl EngineSettings {
    pub fn sanitize(mut self) -> Self {
        self.ghost_sync_frequency = self
            .ghost_sync_frequency
            .clamp(MIN_SYNC_FREQUENCY, MAX_SYNC_FREQUENCY);
        self.logical_update_frequency = self
            .logical_update_frequency
            .clamp(MIN_SYNC_FREQUENCY, MAX_SYNC_FREQUENCY);
        self.default_max_recursion_depth = self
            .default_max_recursion_depth
            .clamp(MIN_RECURSION_DEPTH, MAX_RECURSION_DEPTH);
        self.max_concurrent_teleports = self.max_concurrent_teleports.max(1);
        self.clipping_quality = self
            .clipping_quality
            .clamp(MIN_CLIPPING_QUALITY, MAX_CLIPPING_QUALITY);
        self.min_segment_visibility = self
            .min_segment_visibility
            .clamp(MIN_VISIBILITY_THRESHOLD, MAX_VISIBILITY_THRESHOLD);
        self.smooth_transition_blend_distance = self.smooth_transition_blend_distance.max(0.0);
        self
    }

    /// A missing file is not an error; defaults apply until the host saves.
    pub fn load(path: &Path) -> Result<Self, PortalError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let parsed = toml::from_str::<Self>(&contents).map_err(|e| {
            PortalError::Settings(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to deserialize engine settings: {e}"),
            ))
        })?;
        Ok(parsed.sanitize())
    }

    pub fn save(&self, path: &Path) -> Result<(), PortalError> {
        let settings = self.clone().sanitize();
        let serialized = toml::to_string_pretty(&settings).map_err(|e| {
            PortalError::Settings(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to serialize engine settings: {e}"),
            ))
        })?;
        fs::write(path, serialized)?;
        Ok(())
    }
}

fn default_ghost_sync_frequency() -> f32 {
    60.0
}

fn default_logical_update_frequency() -> f32 {
    60.0
}

fn default_use_logical_entity_control() -> bool {
    true
}

fn default_max_recursion_depth() -> u32 {
    3
}

fn default_auto_swap_on_center_cross() -> bool {
    true
}

fn default_max_concurrent_teleports() -> usize {
    10
}

fn default_clipping_quality() -> u8 {
    2
}

fn default_min_segment_visibility() -> f32 {
    0.05
}

fn default_smooth_transition_blend_distance() -> f32 {
    0.5
}
