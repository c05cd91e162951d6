use serde::{Deserialize, Serialize};

// MARK: - Resolution

/// Frame geometry in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self { width: 1280, height: 720 };
    pub const FHD: Self = Self { width: 1920, height: 1080 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Hidden or minimized windows are reported by capture backends as 1×1
    /// (or empty) frames.
    pub fn is_degenerate(&self) -> bool {
        self.width <= 1 || self.height <= 1
    }

    /// Largest even geometry not exceeding `self`.
    pub fn even_floor(&self) -> Self {
        Self { width: self.width & !1, height: self.height & !1 }
    }

    pub fn is_even(&self) -> bool {
        self.width % 2 == 0 && self.height % 2 == 0
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

// MARK: - VideoCodec

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
}

impl VideoCodec {
    /// SDP payload name.
    pub fn payload_name(&self) -> &'static str {
        match self {
            Self::H264 => "H264",
        }
    }
}

// MARK: - Source

/// Opaque identifier of a capture source, as handed out by the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Screen,
    Window,
}

/// An enumerable capture target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub title: String,
    pub kind: SourceKind,
}

impl Source {
    /// Build a source entry. Screens reported without a title get
    /// `"Screen N"`, where `N` is the 1-based `position` in the enumeration.
    pub fn new(id: SourceId, title: impl Into<String>, kind: SourceKind, position: usize) -> Self {
        let mut title = title.into();
        if title.is_empty() && kind == SourceKind::Screen {
            title = format!("Screen {}", position + 1);
        }
        Self { id, title, kind }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            SourceKind::Screen => "screen",
            SourceKind::Window => "window",
        };
        write!(f, "{} #{} \"{}\"", kind, self.id, self.title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_floor_drops_odd_pixel() {
        assert_eq!(Resolution::new(1279, 719).even_floor(), Resolution::new(1278, 718));
        assert_eq!(Resolution::FHD.even_floor(), Resolution::FHD);
        assert!(!Resolution::new(1279, 720).is_even());
    }

    #[test]
    fn degenerate_geometry() {
        assert!(Resolution::new(1, 1).is_degenerate());
        assert!(Resolution::new(0, 0).is_degenerate());
        assert!(Resolution::new(800, 1).is_degenerate());
        assert!(!Resolution::new(2, 2).is_degenerate());
    }

    #[test]
    fn untitled_screens_are_numbered() {
        let screen = Source::new(SourceId(42), "", SourceKind::Screen, 1);
        assert_eq!(screen.title, "Screen 2");

        let window = Source::new(SourceId(7), "", SourceKind::Window, 0);
        assert_eq!(window.title, "");

        let named = Source::new(SourceId(1), "DELL U2720Q", SourceKind::Screen, 0);
        assert_eq!(named.title, "DELL U2720Q");
    }
}
