use std::path::{Path, PathBuf};

use crate::components::tools::DEFAULT_MIN_SELECTION_SIZE;

// ============================================================================
// EDITOR SETTINGS: key=value file in the platform config directory
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct EditorSettings {
    pub max_undo_steps: usize,
    /// 0 = no memory cap.
    pub max_history_memory_mb: usize,
    pub min_selection_size: f32,
    /// Blur sigma applied when a mask is made from a selection.  0 = hard edge.
    pub default_feather: f32,
    /// JPEG quality for exports (1-100).
    pub export_quality: u8,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            max_undo_steps: 50,
            max_history_memory_mb: 100,
            min_selection_size: DEFAULT_MIN_SELECTION_SIZE,
            default_feather: 0.0,
            export_quality: 90,
        }
    }
}

impl EditorSettings {
    /// Returns the platform-specific settings file path.
    pub(crate) fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("maskfe");
            return Some(config_dir.join("maskfe_settings.cfg"));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA")
                .or_else(|_| std::env::var("USERPROFILE"))
                .ok()?;
            return Some(PathBuf::from(appdata).join("MaskFE").join("maskfe_settings.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("MaskFE")
                    .join("maskfe_settings.cfg"),
            );
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.join("maskfe_settings.cfg")))
        }
    }

    /// Memory cap in bytes for the history, `None` when unlimited.
    pub fn history_memory_bytes(&self) -> Option<usize> {
        (self.max_history_memory_mb > 0).then(|| self.max_history_memory_mb * 1024 * 1024)
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "max_undo_steps={}\n\
             max_history_memory_mb={}\n\
             min_selection_size={}\n\
             default_feather={}\n\
             export_quality={}\n",
            self.max_undo_steps,
            self.max_history_memory_mb,
            self.min_selection_size,
            self.default_feather,
            self.export_quality,
        )
    }

    /// Parse `key=value` lines.  Unknown keys are ignored; a value that
    /// doesn't parse leaves the default in place.
    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let val = val.trim();
            match key.trim() {
                "max_undo_steps" => {
                    if let Ok(v) = val.parse::<usize>() {
                        s.max_undo_steps = v.clamp(1, 10_000);
                    }
                }
                "max_history_memory_mb" => {
                    if let Ok(v) = val.parse::<usize>() {
                        s.max_history_memory_mb = v;
                    }
                }
                "min_selection_size" => {
                    if let Ok(v) = val.parse::<f32>()
                        && v.is_finite()
                    {
                        s.min_selection_size = v.max(0.0);
                    }
                }
                "default_feather" => {
                    if let Ok(v) = val.parse::<f32>()
                        && v.is_finite()
                    {
                        s.default_feather = v.max(0.0);
                    }
                }
                "export_quality" => {
                    if let Ok(v) = val.parse::<u8>() {
                        s.export_quality = v.clamp(1, 100);
                    }
                }
                _ => {}
            }
        }
        s
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_config_string())
    }

    /// Load settings from disk (returns default if file missing or corrupt)
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else { return Self::default() };
        Self::load_from(&path)
    }

    /// Save settings to disk
    pub fn save(&self) {
        let Some(path) = Self::settings_path() else { return };
        if let Err(e) = self.save_to(&path) {
            log_warn!("Settings: could not write {}: {}", path.display(), e);
        }
    }
}
