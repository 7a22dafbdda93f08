//! Transformation steps applied to a source image.
//!
//! Steps are opaque to the request processor; only the imaging engine
//! interprets them. They are parsed from key presets or query parameters by
//! [`crate::object`].

/// A single transformation applied to an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformStep {
    /// Scale to exactly `width` x `height` pixels.
    Resize { width: u32, height: u32 },
    /// Center-crop to at most `width` x `height` pixels.
    Crop { width: u32, height: u32 },
    /// Re-encode the output in the given format.
    Format(OutputFormat),
    /// Convert to grayscale.
    Grayscale,
    /// Rotate clockwise.
    Rotate(Rotation),
}

/// Output encodings the engine can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
}

impl OutputFormat {
    /// Parses a format name as it appears in presets and query strings.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }
}

/// Clockwise rotation in quarter turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    /// Accepts the degree values the proxy understands; anything else is
    /// rejected by the parser.
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees {
            90 => Some(Self::Cw90),
            180 => Some(Self::Cw180),
            270 => Some(Self::Cw270),
            _ => None,
        }
    }

    pub fn degrees(&self) -> u32 {
        match self {
            Self::Cw90 => 90,
            Self::Cw180 => 180,
            Self::Cw270 => 270,
        }
    }
}
