use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::graph::GraphLimits;
use rift_core::cast::CastLimits;

const MIN_RECURSION_DEPTH: u32 = 0;
const MAX_RECURSION_DEPTH: u32 = 8;
const MIN_PORTAL_CROSSINGS: u32 = 1;
const MAX_PORTAL_CROSSINGS: u32 = 32;
const MIN_TARGET_SCALE: f32 = 0.25;
const MAX_TARGET_SCALE: f32 = 1.0;

/// How a finished child pass reaches the parent's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStrategy {
    /// Mask the portal silhouette in the shared target. Cheap, but the
    /// child shares the parent's projection.
    Stencil,
    /// Render into a pooled offscreen target and draw it onto the portal
    /// surface. One target per visible portal, independent projection.
    Texture,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSettings {
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: u32,
    #[serde(default = "default_max_portal_crossings")]
    pub max_portal_crossings: u32,
    #[serde(default = "default_strategy")]
    pub strategy: RenderStrategy,
    #[serde(default = "default_target_scale")]
    pub target_scale: f32,
    /// Applies the oblique near-plane clip to stencil-mode children instead
    /// of reusing the parent projection verbatim. The framing itself always
    /// stays the parent's, since stencil children share its target.
    #[serde(default)]
    pub refit_stencil_projection: bool,
    #[serde(default = "default_shadows")]
    pub shadows: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            max_recursion_depth: default_max_recursion_depth(),
            max_portal_crossings: default_max_portal_crossings(),
            strategy: default_strategy(),
            target_scale: default_target_scale(),
            refit_stencil_projection: false,
            shadows: default_shadows(),
        }
    }
}

impl RenderSettings {
    pub fn sanitize(mut self) -> Self {
        self.max_recursion_depth = self
            .max_recursion_depth
            .clamp(MIN_RECURSION_DEPTH, MAX_RECURSION_DEPTH);
        self.max_portal_crossings = self
            .max_portal_crossings
            .clamp(MIN_PORTAL_CROSSINGS, MAX_PORTAL_CROSSINGS);
        self.target_scale = self.target_scale.clamp(MIN_TARGET_SCALE, MAX_TARGET_SCALE);
        self
    }

    pub fn graph_limits(&self) -> GraphLimits {
        GraphLimits {
            max_depth: self.max_recursion_depth,
        }
    }

    pub fn cast_limits(&self) -> CastLimits {
        CastLimits {
            max_crossings: self.max_portal_crossings,
            ..CastLimits::default()
        }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let parsed = toml::from_str::<Self>(&contents).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to deserialize render settings: {e}"),
            )
        })?;
        Ok(parsed.sanitize())
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let settings = self.clone().sanitize();
        let serialized = toml::to_string_pretty(&settings).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to serialize render settings: {e}"),
            )
        })?;
        fs::write(path, serialized)
    }
}

pub fn load_or_create(path: &Path) -> RenderSettings {
    match RenderSettings::load(path) {
        Ok(settings) => settings,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let settings = RenderSettings::default();
            if let Err(save_err) = settings.save(path) {
                warn!(
                    "Failed to create default render settings at {}: {save_err}",
                    path.display()
                );
            }
            settings
        }
        Err(err) => {
            warn!(
                "Failed to load render settings from {}: {err}",
                path.display()
            );
            RenderSettings::default()
        }
    }
}

fn default_max_recursion_depth() -> u32 {
    4
}

fn default_max_portal_crossings() -> u32 {
    8
}

fn default_strategy() -> RenderStrategy {
    RenderStrategy::Stencil
}

fn default_target_scale() -> f32 {
    0.5
}

fn default_shadows() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::{RenderSettings, RenderStrategy};

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: RenderSettings = toml::from_str("strategy = \"texture\"").unwrap();
        assert_eq!(settings.strategy, RenderStrategy::Texture);
        assert_eq!(settings.max_recursion_depth, 4);
        assert_eq!(settings.max_portal_crossings, 8);
        assert!(settings.shadows);
        assert!(!settings.refit_stencil_projection);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let settings: RenderSettings = toml::from_str(
            "max_recursion_depth = 99\nmax_portal_crossings = 0\ntarget_scale = 2.0",
        )
        .unwrap();
        let settings = settings.sanitize();
        assert_eq!(settings.max_recursion_depth, 8);
        assert_eq!(settings.max_portal_crossings, 1);
        assert_eq!(settings.target_scale, 1.0);
    }

    #[test]
    fn settings_survive_a_toml_round_trip() {
        let mut settings = RenderSettings::default();
        settings.strategy = RenderStrategy::Texture;
        settings.refit_stencil_projection = true;

        let text = toml::to_string_pretty(&settings).unwrap();
        let back: RenderSettings = toml::from_str(&text).unwrap();
        assert_eq!(back.strategy, RenderStrategy::Texture);
        assert!(back.refit_stencil_projection);
        assert_eq!(back.max_recursion_depth, settings.max_recursion_depth);
    }

    #[test]
    fn limits_flow_into_graph_and_cast() {
        let settings = RenderSettings {
            max_recursion_depth: 2,
            max_portal_crossings: 5,
            ..RenderSettings::default()
        };
        assert_eq!(settings.graph_limits().max_depth, 2);
        assert_eq!(settings.cast_limits().max_crossings, 5);
    }
}
