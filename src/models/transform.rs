//! Image transform parameters attached to a retrieve request.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest blur sigma applied. Larger requests are clamped to it.
pub const MAX_BLUR_SIGMA: f32 = 64.0;

/// How a target box is applied to a source image.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMethod {
    /// Keep the whole image inside the box, never crop.
    Fit,
    /// Crop to exactly fill the box, anchored at the center.
    #[default]
    Fill,
}

impl ResizeMethod {
    /// Lenient parse used for query strings: anything but `fit` means fill.
    pub fn parse_lenient(value: &str) -> Self {
        if value.eq_ignore_ascii_case("fit") {
            Self::Fit
        } else {
            Self::Fill
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fit => "fit",
            Self::Fill => "fill",
        }
    }
}

impl fmt::Display for ResizeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested transformation of a stored image.
///
/// A request with every numeric field at zero and both flags off is *empty*:
/// the stored bytes are served verbatim.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct TransformRequest {
    pub method: ResizeMethod,
    pub width: u32,
    pub height: u32,
    /// Gaussian blur sigma. Negative and non-finite values are treated as zero,
    /// values above [`MAX_BLUR_SIGMA`] as the maximum.
    pub blur: f32,
    pub grayscale: bool,
    pub watermark: bool,
}

impl TransformRequest {
    /// A `fit` resize bounded by `width` x `height`.
    pub fn fit(width: u32, height: u32) -> Self {
        Self {
            method: ResizeMethod::Fit,
            width,
            height,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0
            && self.height == 0
            && self.blur_sigma() == 0.0
            && !self.grayscale
            && !self.watermark
    }

    pub fn blur_sigma(&self) -> f32 {
        if self.blur.is_finite() && self.blur > 0.0 {
            self.blur.min(MAX_BLUR_SIGMA)
        } else {
            0.0
        }
    }

    /// Canonical encoding used inside cache fingerprints.
    ///
    /// Only enum names, integers and flags appear here, so no field can
    /// contain the `;` or `=` used as separators.
    pub fn canonical(&self) -> String {
        format!(
            "m={};w={};h={};b={:08x};g={};wm={}",
            self.method,
            self.width,
            self.height,
            self.blur_sigma().to_bits(),
            u8::from(self.grayscale),
            u8::from(self.watermark),
        )
    }
}
