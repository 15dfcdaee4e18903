// Inkwash - GPU fluid canvas
// Licensed under MIT License
//
// Tuning settings: JSON on disk, merged patches at runtime.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const SETTINGS_FILE_NAME: &str = "inkwash_settings.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    pub sim_resolution: u32,        // Velocity/pressure grid scalar
    pub dye_resolution: u32,        // Dye grid scalar
    pub velocity_dissipation: f32,
    pub density_dissipation: f32,
    pub pressure: f32,              // Leaky pressure decay per frame
    pub pressure_iterations: u32,   // Fixed Jacobi count, no early exit
    pub curl: f32,                  // Vorticity confinement strength
    pub splat_radius: f32,          // Percent of the short screen axis
    pub splat_force: f32,
    pub shading: bool,
    pub bloom: bool,
    pub bloom_iterations: u32,
    pub bloom_resolution: u32,
    pub bloom_intensity: f32,
    pub bloom_threshold: f32,
    pub bloom_soft_knee: f32,
    pub sunrays: bool,
    pub sunrays_resolution: u32,
    pub sunrays_weight: f32,
    pub background_color: [f32; 3],
    pub color_scheme: String,
    pub paused: bool,
    pub oscillator_count: u32,      // 0 disables the auto driver
    pub oscillator_damping: f32,
    pub oscillator_stiffness: f32,
    pub oscillator_cubic_stiffness: f32,
    pub oscillator_forcing_amplitude: f32,
    pub oscillator_forcing_frequency: f32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sim_resolution: 128,
            dye_resolution: 1024,
            velocity_dissipation: 0.2,
            density_dissipation: 1.0,
            pressure: 0.8,
            pressure_iterations: 20,
            curl: 30.0,
            splat_radius: 0.25,
            splat_force: 6000.0,
            shading: true,
            bloom: true,
            bloom_iterations: 8,
            bloom_resolution: 256,
            bloom_intensity: 0.8,
            bloom_threshold: 0.6,
            bloom_soft_knee: 0.7,
            sunrays: true,
            sunrays_resolution: 196,
            sunrays_weight: 1.0,
            background_color: [0.0, 0.0, 0.0],
            color_scheme: "default".to_string(),
            paused: false,
            oscillator_count: 3,
            oscillator_damping: 0.35,
            oscillator_stiffness: 1.1,
            oscillator_cubic_stiffness: 0.9,
            oscillator_forcing_amplitude: 1.4,
            oscillator_forcing_frequency: 0.45,
        }
    }
}

impl SimulationConfig {
    pub fn default_path() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(SETTINGS_FILE_NAME)
    }

    pub fn load_from_disk(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let config = serde_json::from_str(&data)?;
        Ok(config)
    }

    pub fn save_to_disk(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    // Missing or unreadable settings fall back to defaults; a corrupt
    // file is reported but never blocks startup.
    pub fn load_or_default(path: &Path) -> Self {
        let mut config = if path.exists() {
            match Self::load_from_disk(path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to load settings from {}: {}", path.display(), e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };
        config.sanitize();
        config
    }

    pub fn sanitize(&mut self) {
        self.sim_resolution = self.sim_resolution.clamp(16, 1024);
        self.dye_resolution = self.dye_resolution.clamp(16, 4096);
        self.velocity_dissipation = self.velocity_dissipation.clamp(0.0, 4.0);
        self.density_dissipation = self.density_dissipation.clamp(0.0, 4.0);
        self.pressure = self.pressure.clamp(0.0, 1.0);
        self.pressure_iterations = self.pressure_iterations.min(100);
        self.curl = self.curl.clamp(0.0, 100.0);
        // Zero radius is legal; the splat pass clamps to an epsilon.
        self.splat_radius = self.splat_radius.clamp(0.0, 1.0);
        self.splat_force = self.splat_force.clamp(0.0, 20_000.0);
        self.bloom_iterations = self.bloom_iterations.min(12);
        self.bloom_resolution = self.bloom_resolution.clamp(2, 1024);
        self.bloom_intensity = self.bloom_intensity.clamp(0.0, 4.0);
        self.bloom_threshold = self.bloom_threshold.clamp(0.0, 4.0);
        self.bloom_soft_knee = self.bloom_soft_knee.clamp(0.0, 1.0);
        self.sunrays_resolution = self.sunrays_resolution.clamp(2, 1024);
        self.sunrays_weight = self.sunrays_weight.clamp(0.0, 4.0);
        for channel in &mut self.background_color {
            *channel = channel.clamp(0.0, 1.0);
        }
        self.oscillator_count = self.oscillator_count.min(16);
        self.oscillator_damping = self.oscillator_damping.clamp(0.0, 10.0);
        self.oscillator_stiffness = self.oscillator_stiffness.clamp(0.0, 50.0);
        self.oscillator_cubic_stiffness = self.oscillator_cubic_stiffness.clamp(0.0, 50.0);
        self.oscillator_forcing_amplitude = self.oscillator_forcing_amplitude.clamp(0.0, 20.0);
        self.oscillator_forcing_frequency = self.oscillator_forcing_frequency.clamp(0.0, 20.0);
    }
}

// Partial update: only the fields present in the patch are applied,
// everything else keeps its current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub sim_resolution: Option<u32>,
    pub dye_resolution: Option<u32>,
    pub velocity_dissipation: Option<f32>,
    pub density_dissipation: Option<f32>,
    pub pressure: Option<f32>,
    pub pressure_iterations: Option<u32>,
    pub curl: Option<f32>,
    pub splat_radius: Option<f32>,
    pub splat_force: Option<f32>,
    pub shading: Option<bool>,
    pub bloom: Option<bool>,
    pub bloom_iterations: Option<u32>,
    pub bloom_resolution: Option<u32>,
    pub bloom_intensity: Option<f32>,
    pub bloom_threshold: Option<f32>,
    pub bloom_soft_knee: Option<f32>,
    pub sunrays: Option<bool>,
    pub sunrays_resolution: Option<u32>,
    pub sunrays_weight: Option<f32>,
    pub background_color: Option<[f32; 3]>,
    pub color_scheme: Option<String>,
    pub paused: Option<bool>,
    pub oscillator_count: Option<u32>,
    pub oscillator_damping: Option<f32>,
    pub oscillator_stiffness: Option<f32>,
    pub oscillator_cubic_stiffness: Option<f32>,
    pub oscillator_forcing_amplitude: Option<f32>,
    pub oscillator_forcing_frequency: Option<f32>,
}

macro_rules! apply_field {
    ($patch:ident, $config:ident, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $patch.$field.clone() {
                $config.$field = value;
            }
        )+
    };
}

impl ConfigPatch {
    pub fn apply(&self, config: &mut SimulationConfig) {
        apply_field!(
            self, config,
            sim_resolution, dye_resolution,
            velocity_dissipation, density_dissipation,
            pressure, pressure_iterations, curl,
            splat_radius, splat_force,
            shading, bloom, bloom_iterations, bloom_resolution,
            bloom_intensity, bloom_threshold, bloom_soft_knee,
            sunrays, sunrays_resolution, sunrays_weight,
            background_color, color_scheme, paused,
            oscillator_count, oscillator_damping, oscillator_stiffness,
            oscillator_cubic_stiffness,
            oscillator_forcing_amplitude, oscillator_forcing_frequency,
        );
        config.sanitize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_survive_sanitize() {
        let mut config = SimulationConfig::default();
        let before = config.clone();
        config.sanitize();
        assert_eq!(config, before, "defaults must already be in range");
    }

    #[test]
    fn test_sanitize_clamps_out_of_range() {
        let mut config = SimulationConfig {
            sim_resolution: 1,
            dye_resolution: 1_000_000,
            pressure: 7.0,
            pressure_iterations: 9999,
            splat_radius: -3.0,
            bloom_soft_knee: 2.0,
            background_color: [2.0, -1.0, 0.5],
            ..SimulationConfig::default()
        };
        config.sanitize();
        assert_eq!(config.sim_resolution, 16);
        assert_eq!(config.dye_resolution, 4096);
        assert_eq!(config.pressure, 1.0);
        assert_eq!(config.pressure_iterations, 100);
        assert_eq!(config.splat_radius, 0.0);
        assert_eq!(config.bloom_soft_knee, 1.0);
        assert_eq!(config.background_color, [1.0, 0.0, 0.5]);
    }

    #[test]
    fn test_partial_json_merges_over_defaults() {
        let config: SimulationConfig =
            serde_json::from_str(r#"{ "curl": 12.5, "bloom": false }"#)
                .expect("partial settings should deserialize");
        assert_eq!(config.curl, 12.5);
        assert!(!config.bloom);
        // Untouched fields keep their defaults.
        assert_eq!(config.sim_resolution, 128);
        assert_eq!(config.color_scheme, "default");
    }

    #[test]
    fn test_patch_applies_only_present_fields() {
        let mut config = SimulationConfig::default();
        let patch = ConfigPatch {
            curl: Some(45.0),
            color_scheme: Some("ocean".to_string()),
            ..ConfigPatch::default()
        };
        patch.apply(&mut config);
        assert_eq!(config.curl, 45.0);
        assert_eq!(config.color_scheme, "ocean");
        assert_eq!(config.splat_force, 6000.0, "unpatched field changed");
    }

    #[test]
    fn test_patch_sanitizes_applied_values() {
        let mut config = SimulationConfig::default();
        let patch = ConfigPatch {
            pressure: Some(42.0),
            ..ConfigPatch::default()
        };
        patch.apply(&mut config);
        assert_eq!(config.pressure, 1.0);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let mut config = SimulationConfig::default();
        config.curl = 17.0;
        config.color_scheme = "neon".to_string();
        let path = std::env::temp_dir().join("inkwash_settings_test.json");
        config.save_to_disk(&path).expect("save should succeed");
        let loaded = SimulationConfig::load_from_disk(&path).expect("load should succeed");
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let path = std::env::temp_dir().join("inkwash_settings_missing.json");
        let _ = std::fs::remove_file(&path);
        let config = SimulationConfig::load_or_default(&path);
        assert_eq!(config, SimulationConfig::default());
    }
}
