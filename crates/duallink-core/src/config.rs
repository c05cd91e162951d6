use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Resolution;

pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_MAX_BITRATE_KBPS: u32 = 6000;
pub const DEFAULT_MIN_BITRATE_KBPS: u32 = 3000;

// MARK: - SourceType

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    #[serde(alias = "fullScreen")]
    FullScreen,
    Application,
}

// MARK: - CapturePolicy

/// Hints for the capture backend. Backends ignore bits they do not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapturePolicy(pub u32);

impl CapturePolicy {
    pub const NONE: Self = Self(0);
    pub const HARDWARE_ACCEL: Self = Self(1 << 0);
    pub const WINDOW_EFFECTS: Self = Self(1 << 1);
    pub const UPDATE_REGION_REPORTING: Self = Self(1 << 2);
    pub const MAGNIFICATION: Self = Self(1 << 3);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self::HARDWARE_ACCEL
    }
}

impl std::ops::BitOr for CapturePolicy {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CapturePolicy {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// MARK: - Encoder selection

/// Which family of H.264 encoders the session may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderBackend {
    /// VA-API / NVENC / Quick Sync, whichever is installed.
    #[default]
    Hardware,
    /// x264 or OpenH264.
    Software,
}

impl std::fmt::Display for EncoderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hardware => f.write_str("hardware"),
            Self::Software => f.write_str("software"),
        }
    }
}

/// Encoder speed/quality trade-off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderQuality {
    Speed,
    #[default]
    Balanced,
    Quality,
}

// MARK: - CaptureParameters

/// Parameters for one capture session.
///
/// Zero numeric fields mean "use the default"; see the `effective_*` helpers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureParameters {
    #[serde(alias = "cursorEnabled")]
    pub cursor_enabled: bool,
    #[serde(alias = "sourceType")]
    pub source_type: SourceType,
    #[serde(alias = "capturePolicy")]
    pub capture_policy: CapturePolicy,
    pub fps: u32,
    /// Output width. `0` keeps the captured width.
    pub width: u32,
    /// Output height. `0` keeps the captured height.
    pub height: u32,
    #[serde(alias = "maxBitrateKbps", alias = "maxBitrate")]
    pub max_bitrate_kbps: u32,
    #[serde(alias = "minBitrateKbps", alias = "minBitrate")]
    pub min_bitrate_kbps: u32,
    /// Append the encoded Annex-B stream to this file.
    #[serde(alias = "encodedFilePath", alias = "diagnosticDumpPath")]
    pub encoded_file_path: Option<PathBuf>,
    #[serde(alias = "encoderBackend")]
    pub encoder_backend: EncoderBackend,
    #[serde(alias = "encoderQuality")]
    pub encoder_quality: EncoderQuality,
}

impl Default for CaptureParameters {
    fn default() -> Self {
        Self {
            cursor_enabled: true,
            source_type: SourceType::FullScreen,
            capture_policy: CapturePolicy::default(),
            fps: DEFAULT_FPS,
            width: 0,
            height: 0,
            max_bitrate_kbps: DEFAULT_MAX_BITRATE_KBPS,
            min_bitrate_kbps: DEFAULT_MIN_BITRATE_KBPS,
            encoded_file_path: None,
            encoder_backend: EncoderBackend::Hardware,
            encoder_quality: EncoderQuality::Balanced,
        }
    }
}

impl CaptureParameters {
    pub fn effective_fps(&self) -> u32 {
        if self.fps == 0 { DEFAULT_FPS } else { self.fps }
    }

    pub fn effective_max_bitrate_kbps(&self) -> u32 {
        if self.max_bitrate_kbps == 0 {
            DEFAULT_MAX_BITRATE_KBPS
        } else {
            self.max_bitrate_kbps
        }
    }

    /// Minimum bitrate, clamped so it never exceeds the maximum.
    pub fn effective_min_bitrate_kbps(&self) -> u32 {
        let min = if self.min_bitrate_kbps == 0 {
            DEFAULT_MIN_BITRATE_KBPS
        } else {
            self.min_bitrate_kbps
        };
        min.min(self.effective_max_bitrate_kbps())
    }

    /// Target interval between capture ticks.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.effective_fps() as u64)
    }

    /// Requested output geometry, if both dimensions are set.
    pub fn target_resolution(&self) -> Option<Resolution> {
        (self.width > 0 && self.height > 0).then(|| Resolution::new(self.width, self.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "cursorEnabled": false,
            "sourceType": "application",
            "capturePolicy": 5,
            "fps": 60,
            "maxBitrateKbps": 4000,
            "minBitrateKbps": 2000,
            "diagnosticDumpPath": "/tmp/capture.h264",
            "encoderBackend": "software"
        }"#;

        let params: CaptureParameters = serde_json::from_str(json).expect("valid camelCase params");
        assert!(!params.cursor_enabled);
        assert_eq!(params.source_type, SourceType::Application);
        assert!(params.capture_policy.contains(CapturePolicy::HARDWARE_ACCEL));
        assert!(params.capture_policy.contains(CapturePolicy::UPDATE_REGION_REPORTING));
        assert!(!params.capture_policy.contains(CapturePolicy::MAGNIFICATION));
        assert_eq!(params.fps, 60);
        assert_eq!(params.max_bitrate_kbps, 4000);
        assert_eq!(params.min_bitrate_kbps, 2000);
        assert_eq!(params.encoded_file_path, Some(PathBuf::from("/tmp/capture.h264")));
        assert_eq!(params.encoder_backend, EncoderBackend::Software);
        assert_eq!(params.encoder_quality, EncoderQuality::Balanced);
    }

    #[test]
    fn deserializes_snake_case_fields() {
        let json = r#"{
            "source_type": "full_screen",
            "fps": 15,
            "width": 1280,
            "height": 720,
            "encoder_quality": "speed"
        }"#;

        let params: CaptureParameters = serde_json::from_str(json).expect("valid snake_case params");
        assert_eq!(params.source_type, SourceType::FullScreen);
        assert_eq!(params.fps, 15);
        assert_eq!(params.target_resolution(), Some(Resolution::HD));
        assert_eq!(params.encoder_quality, EncoderQuality::Speed);
        assert_eq!(params.max_bitrate_kbps, DEFAULT_MAX_BITRATE_KBPS);
    }

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let params = CaptureParameters {
            fps: 0,
            max_bitrate_kbps: 0,
            min_bitrate_kbps: 0,
            ..Default::default()
        };
        assert_eq!(params.effective_fps(), 30);
        assert_eq!(params.effective_max_bitrate_kbps(), 6000);
        assert_eq!(params.effective_min_bitrate_kbps(), 3000);
        assert_eq!(params.frame_interval(), Duration::from_micros(33_333));
        assert_eq!(params.target_resolution(), None);
    }

    #[test]
    fn min_bitrate_is_clamped_to_max() {
        let params = CaptureParameters {
            max_bitrate_kbps: 1500,
            min_bitrate_kbps: 2500,
            ..Default::default()
        };
        assert_eq!(params.effective_min_bitrate_kbps(), 1500);
    }

    #[test]
    fn policy_flags_combine() {
        let mut policy = CapturePolicy::NONE;
        assert!(policy.is_empty());
        policy |= CapturePolicy::WINDOW_EFFECTS;
        let policy = policy | CapturePolicy::MAGNIFICATION;
        assert_eq!(policy.0, 0b1010);
        assert!(policy.contains(CapturePolicy::WINDOW_EFFECTS | CapturePolicy::MAGNIFICATION));
    }
}
