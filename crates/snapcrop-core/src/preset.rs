use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::CoreError;

pub const MIN_TARGET_WIDTH: u32 = 100;
pub const DEFAULT_TARGET_WIDTH: u32 = 1080;
pub const TARGET_WIDTH_STEP: u32 = 10;

/// Width:height ratio of a crop target. Components are not reduced, so
/// `1.91:1` stays as written.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AspectRatio {
    pub width: f64,
    pub height: f64,
}

impl AspectRatio {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_valid(self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }

    /// Height that matches `target_width` under this ratio, truncated toward
    /// zero and never below one pixel.
    pub fn target_height(self, target_width: u32) -> u32 {
        let height = (target_width as f64 * self.height / self.width) as u32;
        height.max(1)
    }
}

impl Display for AspectRatio {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AspectPreset {
    #[default]
    InstagramSquare,
    InstagramPortrait,
    InstagramLandscape,
    InstagramStory,
    FacebookFeed,
    FacebookSquare,
    FacebookStory,
    FacebookEventCover,
}

impl AspectPreset {
    pub fn all() -> [AspectPreset; 8] {
        [
            Self::InstagramSquare,
            Self::InstagramPortrait,
            Self::InstagramLandscape,
            Self::InstagramStory,
            Self::FacebookFeed,
            Self::FacebookSquare,
            Self::FacebookStory,
            Self::FacebookEventCover,
        ]
    }

    pub fn slug(self) -> &'static str {
        match self {
            Self::InstagramSquare => "instagram-square",
            Self::InstagramPortrait => "instagram-portrait",
            Self::InstagramLandscape => "instagram-landscape",
            Self::InstagramStory => "instagram-story",
            Self::FacebookFeed => "facebook-feed",
            Self::FacebookSquare => "facebook-square",
            Self::FacebookStory => "facebook-story",
            Self::FacebookEventCover => "facebook-event-cover",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::InstagramSquare => "Instagram - Square (1:1)",
            Self::InstagramPortrait => "Instagram - Portrait (4:5)",
            Self::InstagramLandscape => "Instagram - Landscape (1.91:1)",
            Self::InstagramStory => "Instagram - Reels/Story (9:16)",
            Self::FacebookFeed => "Facebook - Feed Image (1.91:1)",
            Self::FacebookSquare => "Facebook - Square (1:1)",
            Self::FacebookStory => "Facebook - Story (9:16)",
            Self::FacebookEventCover => "Facebook - Event Cover (16:9)",
        }
    }

    pub fn ratio(self) -> AspectRatio {
        match self {
            Self::InstagramSquare | Self::FacebookSquare => AspectRatio::new(1.0, 1.0),
            Self::InstagramPortrait => AspectRatio::new(4.0, 5.0),
            Self::InstagramLandscape | Self::FacebookFeed => AspectRatio::new(1.91, 1.0),
            Self::InstagramStory | Self::FacebookStory => AspectRatio::new(9.0, 16.0),
            Self::FacebookEventCover => AspectRatio::new(16.0, 9.0),
        }
    }

    /// Accepts a slug or the full label, case-insensitively.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        let normalized = value.trim();
        Self::all()
            .into_iter()
            .find(|preset| preset.slug().eq_ignore_ascii_case(normalized) || preset.label().eq_ignore_ascii_case(normalized))
            .ok_or_else(|| {
                let known = Self::all().iter().map(|p| p.slug()).collect::<Vec<_>>().join(", ");
                CoreError::InvalidRequest(format!("unknown aspect preset '{}'; expected one of: {}", value, known))
            })
    }
}

impl Display for AspectPreset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Range a host offers for the crop width of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidthBounds {
    pub min: u32,
    pub max: u32,
    pub default: u32,
    pub step: u32,
}

impl WidthBounds {
    pub fn for_image(image_width: u32) -> Self {
        let max = image_width.max(1);
        let min = MIN_TARGET_WIDTH.min(max);
        Self {
            min,
            max,
            default: DEFAULT_TARGET_WIDTH.clamp(min, max),
            step: TARGET_WIDTH_STEP,
        }
    }

    pub fn clamp(&self, requested: Option<u32>) -> u32 {
        requested.unwrap_or(DEFAULT_TARGET_WIDTH).clamp(self.min, self.max)
    }
}
