//! Image analysis adapter
//!
//! Downscales and re-encodes an image, then asks a vision-capable model for
//! a description. The description becomes an `ImageDescription` turn input.

use crate::gateway::{GeminiBackend, OpenAiChatBackend};
use crate::{CompanionError, ModelProvider, ModelSettings, Result, VisionSettings};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

/// Instruction sent alongside every image
pub const ANALYSIS_PROMPT: &str =
    "Describe this image in detail and identify any relevant information.";

const START_QUALITY: u8 = 85;
const QUALITY_STEP: u8 = 15;
const MIN_QUALITY: u8 = 40;

/// Re-encoded image ready for upload
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
    pub width: u32,
    pub height: u32,
}

impl PreparedImage {
    pub fn base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.base64())
    }
}

/// Decode, flatten transparency onto white, shrink to `max_dimension` on the
/// longest side, and encode as JPEG at falling quality until the result fits
/// `max_bytes` or the quality floor is reached.
pub fn prepare_image(raw: &[u8], max_dimension: u32, max_bytes: usize) -> Result<PreparedImage> {
    let decoded = image::load_from_memory(raw)
        .map_err(|e| CompanionError::Analysis(format!("unreadable image: {e}")))?;

    let rgba = decoded.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend =
            |channel: u8| (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8;
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }

    let dim = max_dimension.max(1);
    let rgb = if flattened.width() > dim || flattened.height() > dim {
        DynamicImage::ImageRgb8(flattened)
            .resize(dim, dim, FilterType::Triangle)
            .to_rgb8()
    } else {
        flattened
    };

    let mut quality = START_QUALITY;
    loop {
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, quality)
            .encode_image(&rgb)
            .map_err(|e| CompanionError::Analysis(format!("jpeg encode: {e}")))?;

        if bytes.len() <= max_bytes || quality <= MIN_QUALITY {
            debug!(
                "Prepared image {}x{} at quality {} ({} bytes)",
                rgb.width(),
                rgb.height(),
                quality,
                bytes.len()
            );
            return Ok(PreparedImage {
                bytes,
                mime: "image/jpeg",
                width: rgb.width(),
                height: rgb.height(),
            });
        }
        quality = quality.saturating_sub(QUALITY_STEP).max(MIN_QUALITY);
    }
}

#[derive(Serialize)]
struct VisionChatRequest<'a> {
    model: &'a str,
    messages: [VisionChatMessage<'a>; 1],
    max_tokens: u32,
}

#[derive(Serialize)]
struct VisionChatMessage<'a> {
    role: &'static str,
    content: [VisionChatPart<'a>; 2],
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum VisionChatPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VisionGenerateRequest<'a> {
    contents: [VisionContent<'a>; 1],
    generation_config: VisionGenerationConfig,
}

#[derive(Serialize)]
struct VisionContent<'a> {
    role: &'static str,
    parts: [VisionPart<'a>; 2],
}

#[derive(Serialize)]
#[serde(untagged)]
enum VisionPart<'a> {
    Text {
        text: &'a str,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VisionGenerationConfig {
    max_output_tokens: u32,
}

enum VisionBackend {
    Openai(OpenAiChatBackend),
    Gemini { backend: GeminiBackend, model: String },
}

/// Produces descriptions for uploaded images. A failure aborts the turn
/// before the orchestrator sees it; there is no retry.
pub struct ImageAnalyzer {
    backend: VisionBackend,
    settings: VisionSettings,
}

impl ImageAnalyzer {
    pub fn from_settings(model: &ModelSettings, vision: &VisionSettings) -> Result<Self> {
        let mut model = model.clone();
        if let Some(name) = &vision.model {
            model.model = name.clone();
        }
        let backend = match model.provider {
            ModelProvider::Openai => VisionBackend::Openai(OpenAiChatBackend::new(&model)?),
            ModelProvider::Gemini => VisionBackend::Gemini {
                backend: GeminiBackend::new(&model)?,
                model: model.model.clone(),
            },
        };
        info!("Image analyzer: provider={:?}, model={}", model.provider, model.model);
        Ok(Self {
            backend,
            settings: vision.clone(),
        })
    }

    pub async fn analyze_path(&self, path: &Path) -> Result<String> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| CompanionError::Analysis(format!("{}: {e}", path.display())))?;
        self.analyze(&raw).await
    }

    pub async fn analyze(&self, raw: &[u8]) -> Result<String> {
        let image = prepare_image(raw, self.settings.max_dimension, self.settings.max_bytes)?;

        let outcome = match &self.backend {
            VisionBackend::Openai(backend) => {
                let request = VisionChatRequest {
                    model: backend.model(),
                    messages: [VisionChatMessage {
                        role: "user",
                        content: [
                            VisionChatPart::Text {
                                text: ANALYSIS_PROMPT,
                            },
                            VisionChatPart::ImageUrl {
                                image_url: ImageUrl {
                                    url: image.data_url(),
                                },
                            },
                        ],
                    }],
                    max_tokens: backend.max_output_tokens(),
                };
                backend.post(&request).await
            }
            VisionBackend::Gemini { backend, model } => {
                let request = VisionGenerateRequest {
                    contents: [VisionContent {
                        role: "user",
                        parts: [
                            VisionPart::Text {
                                text: ANALYSIS_PROMPT,
                            },
                            VisionPart::Inline {
                                inline_data: InlineData {
                                    mime_type: image.mime,
                                    data: image.base64(),
                                },
                            },
                        ],
                    }],
                    generation_config: VisionGenerationConfig {
                        max_output_tokens: backend.max_output_tokens(),
                    },
                };
                backend.post(model, &request).await
            }
        };

        let description = outcome
            .map_err(|e| CompanionError::Analysis(e.to_string()))?
            .trim()
            .to_string();
        if description.is_empty() {
            return Err(CompanionError::Analysis("model returned no description".into()));
        }
        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32, pixel: Rgba<u8>) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, pixel);
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_large_image_is_downscaled_keeping_aspect() {
        let raw = png(2048, 1024, Rgba([10, 120, 200, 255]));
        let prepared = prepare_image(&raw, 1024, 1024 * 1024).unwrap();
        assert_eq!(prepared.mime, "image/jpeg");
        assert_eq!((prepared.width, prepared.height), (1024, 512));
        assert!(prepared.bytes.len() <= 1024 * 1024);
        assert_eq!(&prepared.bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_small_image_is_not_upscaled() {
        let raw = png(40, 30, Rgba([0, 0, 0, 255]));
        let prepared = prepare_image(&raw, 1024, 1024 * 1024).unwrap();
        assert_eq!((prepared.width, prepared.height), (40, 30));
    }

    #[test]
    fn test_transparent_pixels_flatten_to_white() {
        let raw = png(8, 8, Rgba([0, 0, 0, 0]));
        let prepared = prepare_image(&raw, 1024, 1024 * 1024).unwrap();
        let decoded = image::load_from_memory(&prepared.bytes).unwrap().to_rgb8();
        let px = decoded.get_pixel(4, 4);
        assert!(px[0] > 240 && px[1] > 240 && px[2] > 240);
    }

    #[test]
    fn test_tight_byte_budget_stops_at_quality_floor() {
        let raw = png(64, 64, Rgba([200, 30, 30, 255]));
        // Unreachable budget still yields an image rather than an error
        let prepared = prepare_image(&raw, 1024, 1).unwrap();
        assert!(!prepared.bytes.is_empty());
    }

    #[test]
    fn test_garbage_bytes_are_analysis_error() {
        let err = prepare_image(b"definitely not an image", 1024, 1024).unwrap_err();
        assert_eq!(err.reason(), "analysis_error");
    }

    #[test]
    fn test_data_url_shape() {
        let raw = png(4, 4, Rgba([1, 2, 3, 255]));
        let prepared = prepare_image(&raw, 1024, 1024 * 1024).unwrap();
        assert!(prepared.data_url().starts_with("data:image/jpeg;base64,/9j/"));
    }

    #[test]
    fn test_gemini_request_serialization() {
        let request = VisionGenerateRequest {
            contents: [VisionContent {
                role: "user",
                parts: [
                    VisionPart::Text {
                        text: ANALYSIS_PROMPT,
                    },
                    VisionPart::Inline {
                        inline_data: InlineData {
                            mime_type: "image/jpeg",
                            data: "AAAA".into(),
                        },
                    },
                ],
            }],
            generation_config: VisionGenerationConfig {
                max_output_tokens: 256,
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["contents"][0]["parts"][0]["text"], ANALYSIS_PROMPT);
        assert_eq!(
            value["contents"][0]["parts"][1]["inlineData"]["mimeType"],
            "image/jpeg"
        );
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 256);
    }

    #[test]
    fn test_openai_request_serialization() {
        let request = VisionChatRequest {
            model: "gpt-4o-mini",
            messages: [VisionChatMessage {
                role: "user",
                content: [
                    VisionChatPart::Text {
                        text: ANALYSIS_PROMPT,
                    },
                    VisionChatPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/jpeg;base64,AAAA".into(),
                        },
                    },
                ],
            }],
            max_tokens: 300,
        };
        let value = serde_json::to_value(&request).unwrap();
        let parts = &value["messages"][0]["content"];
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/jpeg;base64,AAAA");
    }
}
