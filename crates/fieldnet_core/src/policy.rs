//! Tier-driven content degradation.
//!
//! Pure lookup tables that feature code consults before fetching media:
//! how large an image to ask for, how many images to load at once, how
//! often to sync, and which connection-hungry features to offer. Also
//! gzip helpers for shrinking payloads on the wire.

use crate::types::{BandwidthLevel, ConnectionTier};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fmt;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::warn;

/// What an image is used for; decides its dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    /// Avatar or profile picture.
    Profile,
    /// Marketplace listing photo.
    Listing,
    /// Wide farm or landscape photo.
    Farm,
    /// Anything else; only quality is constrained.
    General,
}

/// Progressive image quality step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImageQuality {
    /// Placeholder quality, loaded first.
    Low,
    /// Readable on a small screen.
    Medium,
    /// Full quality.
    High,
}

/// Features that are switched off on slow links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuralFeature {
    /// Live chat.
    RealTimeChat,
    /// Video calls.
    VideoCalls,
    /// Full-resolution images.
    HighQualityImages,
    /// Voice search.
    VoiceSearch,
    /// Live auctions.
    LiveAuctions,
    /// Background sync; always on, only its interval changes.
    AutoSync,
}

/// Broad content category used for size estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// Still image.
    Image,
    /// Video clip.
    Video,
    /// Audio clip.
    Audio,
    /// Text or JSON.
    Text,
    /// Anything else.
    Other,
}

impl ContentType {
    /// Parses a loose label such as `"image"` or `"VIDEO"`.
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            "text" => Self::Text,
            _ => Self::Other,
        }
    }

    fn base_bytes(self) -> u64 {
        match self {
            Self::Image => 500_000,
            Self::Video => 5_000_000,
            Self::Audio => 3_000_000,
            Self::Text => 50_000,
            Self::Other => 100_000,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Text => "text",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Query parameters selecting image quality and size for a connection.
pub fn image_query(tier: ConnectionTier, image_type: ImageType) -> &'static str {
    use ImageType::{Farm, General, Listing, Profile};

    match tier {
        ConnectionTier::Wifi => match image_type {
            Profile => "q=85&w=400&h=400",
            Listing => "q=90&w=800&h=600",
            Farm => "q=85&w=1200&h=800",
            General => "q=80",
        },
        ConnectionTier::Cellular4G => match image_type {
            Profile => "q=70&w=300&h=300",
            Listing => "q=75&w=600&h=450",
            Farm => "q=70&w=800&h=600",
            General => "q=65",
        },
        ConnectionTier::Cellular3G => match image_type {
            Profile => "q=50&w=200&h=200",
            Listing => "q=55&w=400&h=300",
            Farm => "q=50&w=600&h=400",
            General => "q=45",
        },
        ConnectionTier::Cellular2G => match image_type {
            Profile => "q=30&w=150&h=150",
            Listing => "q=35&w=300&h=225",
            Farm => "q=30&w=400&h=300",
            General => "q=25",
        },
        ConnectionTier::None | ConnectionTier::Unknown => "q=40&w=300&h=225",
    }
}

/// Appends the tier's image parameters and `format=webp` to a URL.
pub fn optimized_image_url(url: &str, tier: ConnectionTier, image_type: ImageType) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!(
        "{url}{separator}{}&format=webp",
        image_query(tier, image_type)
    )
}

/// How many images to load in parallel.
pub fn image_batch_size(tier: ConnectionTier) -> usize {
    match tier {
        ConnectionTier::Wifi => 10,
        ConnectionTier::Cellular4G => 6,
        ConnectionTier::Cellular3G => 3,
        ConnectionTier::Cellular2G => 1,
        ConnectionTier::None | ConnectionTier::Unknown => 2,
    }
}

/// How often feature data should be refreshed in the background.
pub fn sync_interval(tier: ConnectionTier) -> Duration {
    let secs = match tier {
        ConnectionTier::Wifi => 10,
        ConnectionTier::Cellular4G => 30,
        ConnectionTier::Cellular3G => 60,
        ConnectionTier::Cellular2G => 300,
        ConnectionTier::None | ConnectionTier::Unknown => 120,
    };
    Duration::from_secs(secs)
}

/// Whether a feature should be offered on this connection.
pub fn feature_enabled(feature: RuralFeature, tier: ConnectionTier) -> bool {
    match feature {
        RuralFeature::RealTimeChat | RuralFeature::VoiceSearch | RuralFeature::LiveAuctions => {
            tier != ConnectionTier::Cellular2G
        }
        RuralFeature::VideoCalls => {
            matches!(tier, ConnectionTier::Wifi | ConnectionTier::Cellular4G)
        }
        RuralFeature::HighQualityImages => tier == ConnectionTier::Wifi,
        RuralFeature::AutoSync => true,
    }
}

/// Target image quality for a measured bandwidth level.
///
/// Anything below `High` should load a `Low` placeholder first.
pub fn image_quality(level: BandwidthLevel) -> ImageQuality {
    match level {
        BandwidthLevel::Low => ImageQuality::Low,
        BandwidthLevel::Medium => ImageQuality::Medium,
        BandwidthLevel::High => ImageQuality::High,
    }
}

/// Expected transfer size of one item of content on this connection.
pub fn estimated_content_bytes(content_type: ContentType, tier: ConnectionTier) -> u64 {
    // share of the full-size item served on this tier, in percent
    let percent: u64 = match tier {
        ConnectionTier::Wifi => 100,
        ConnectionTier::Cellular4G => 80,
        ConnectionTier::Cellular3G | ConnectionTier::Unknown => 60,
        ConnectionTier::Cellular2G => 40,
        ConnectionTier::None => 0,
    };
    content_type.base_bytes() * percent / 100
}

/// Gzips a payload for upload.
///
/// Falls back to the raw bytes if encoding fails.
pub fn compress_payload(data: &[u8]) -> Vec<u8> {
    match gzip(data) {
        Ok(compressed) => compressed,
        Err(err) => {
            warn!(error = %err, "payload compression failed, sending raw bytes");
            data.to_vec()
        }
    }
}

/// Inflates a gzip payload.
///
/// Input that is not a complete gzip stream is returned unchanged, so
/// servers that answer uncompressed still work.
pub fn decompress_payload(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    match GzDecoder::new(data).read_to_end(&mut out) {
        Ok(_) => out,
        Err(err) => {
            warn!(error = %err, "payload is not gzip, using it as is");
            data.to_vec()
        }
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_urls() {
        assert_eq!(
            optimized_image_url(
                "https://cdn.example/fowl.jpg",
                ConnectionTier::Wifi,
                ImageType::Profile
            ),
            "https://cdn.example/fowl.jpg?q=85&w=400&h=400&format=webp"
        );
        assert_eq!(
            optimized_image_url(
                "https://cdn.example/f.jpg?v=2",
                ConnectionTier::Cellular2G,
                ImageType::General
            ),
            "https://cdn.example/f.jpg?v=2&q=25&format=webp"
        );
        assert_eq!(
            image_query(ConnectionTier::None, ImageType::Farm),
            "q=40&w=300&h=225"
        );
    }

    #[test]
    fn batch_and_interval_shrink_with_tier() {
        assert_eq!(image_batch_size(ConnectionTier::Wifi), 10);
        assert_eq!(image_batch_size(ConnectionTier::Cellular2G), 1);
        assert_eq!(image_batch_size(ConnectionTier::Unknown), 2);
        assert_eq!(sync_interval(ConnectionTier::Cellular3G), Duration::from_secs(60));
        assert_eq!(sync_interval(ConnectionTier::Cellular2G), Duration::from_secs(300));
        assert_eq!(sync_interval(ConnectionTier::None), Duration::from_secs(120));
    }

    #[test]
    fn feature_gating() {
        assert!(!feature_enabled(RuralFeature::RealTimeChat, ConnectionTier::Cellular2G));
        assert!(feature_enabled(RuralFeature::RealTimeChat, ConnectionTier::Cellular3G));
        assert!(feature_enabled(RuralFeature::VideoCalls, ConnectionTier::Cellular4G));
        assert!(!feature_enabled(RuralFeature::VideoCalls, ConnectionTier::Cellular3G));
        assert!(!feature_enabled(RuralFeature::HighQualityImages, ConnectionTier::Cellular4G));
        assert!(feature_enabled(RuralFeature::AutoSync, ConnectionTier::None));
    }

    #[test]
    fn content_estimates() {
        assert_eq!(
            estimated_content_bytes(ContentType::Image, ConnectionTier::Wifi),
            500_000
        );
        assert_eq!(
            estimated_content_bytes(ContentType::from_label("VIDEO"), ConnectionTier::Cellular2G),
            2_000_000
        );
        assert_eq!(
            estimated_content_bytes(ContentType::from_label("pdf"), ConnectionTier::Cellular4G),
            80_000
        );
        assert_eq!(
            estimated_content_bytes(ContentType::Audio, ConnectionTier::None),
            0
        );
    }

    #[test]
    fn compressed_payload_inflates_back() {
        let record = br#"{"flock":"north","birds":120,"vaccinated":true}"#.repeat(40);
        let compressed = compress_payload(&record);

        assert!(compressed.len() < record.len() / 4);
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        assert_eq!(decompress_payload(&compressed), record);
    }

    #[test]
    fn plain_payload_passes_through_decompression() {
        let plain = br#"{"status":"ok"}"#;
        assert_eq!(decompress_payload(plain), plain.to_vec());
    }

    #[test]
    fn cut_off_gzip_falls_back_to_raw_bytes() {
        let compressed = compress_payload(&b"market prices ".repeat(50));
        let cut = &compressed[..compressed.len() / 2];
        assert_eq!(decompress_payload(cut), cut.to_vec());
    }

    #[test]
    fn quality_by_level() {
        assert_eq!(image_quality(BandwidthLevel::Low), ImageQuality::Low);
        assert_eq!(image_quality(BandwidthLevel::High), ImageQuality::High);
    }
}
