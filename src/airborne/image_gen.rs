//! C11 — image generator. Trigger-phrase / slash-command driven image synthesis.
//!
//! Generalizes the teacher's `ImageGenerationClient` trait (`image_generation.rs`) into the
//! uniform contract described by §4.9/§4.11: a prompt, a provider identifier, model, and
//! max-images in, raw bytes (+ metadata) out. Gemini returns inline base64 PNG bytes which this
//! module re-encodes to JPEG.

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub alt_text: String,
}

#[derive(Debug, Clone)]
pub struct ImageGenRequest {
    pub prompt: String,
    pub provider: String,
    pub model: Option<String>,
    pub max_images: u32,
    pub api_key: String,
}

/// The uniform image-generation contract; one implementation per provider family.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    fn provider(&self) -> &str;
    async fn generate(&self, request: &ImageGenRequest) -> Result<Vec<GeneratedImage>, String>;
}

/// Re-encode PNG bytes to JPEG, as Gemini's inline base64 output requires (§4.9).
pub fn png_to_jpeg(png_bytes: &[u8]) -> Result<Vec<u8>, String> {
    let img = image::load_from_memory_with_format(png_bytes, image::ImageFormat::Png)
        .map_err(|e| format!("failed to decode PNG: {}", e))?;
    let mut out = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Jpeg)
        .map_err(|e| format!("failed to encode JPEG: {}", e))?;
    Ok(out)
}

/// Gemini's inline-image responses carry a `data:<mime>;base64,<data>` or bare base64 payload.
/// Decoded without an external crate, matching the teacher's own hand-rolled base64 helpers.
pub fn decode_inline_image(b64_data: &str) -> Result<Vec<u8>, String> {
    let stripped = b64_data
        .split_once("base64,")
        .map(|(_, data)| data)
        .unwrap_or(b64_data);
    base64_decode_bytes(stripped)
}

fn base64_decode_bytes(s: &str) -> Result<Vec<u8>, String> {
    const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut reverse = [255u8; 256];
    for (i, &c) in TABLE.iter().enumerate() {
        reverse[c as usize] = i as u8;
    }

    let input = s.trim_end_matches('=');
    let bytes = input.as_bytes();
    let mut output = Vec::with_capacity(bytes.len() * 3 / 4 + 3);

    for chunk in bytes.chunks(4) {
        if chunk.len() < 2 {
            return Err("truncated base64 input".to_string());
        }
        let mut buf = [0u8; 4];
        for (i, &c) in chunk.iter().enumerate() {
            let v = reverse[c as usize];
            if v == 255 {
                return Err("invalid base64 character".to_string());
            }
            buf[i] = v;
        }
        output.push((buf[0] << 2) | (buf[1] >> 4));
        if chunk.len() > 2 {
            output.push((buf[1] << 4) | (buf[2] >> 2));
        }
        if chunk.len() > 3 {
            output.push((buf[2] << 6) | buf[3]);
        }
    }
    Ok(output)
}

pub struct GeminiImageGenerator;

#[async_trait]
impl ImageGenerator for GeminiImageGenerator {
    fn provider(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, request: &ImageGenRequest) -> Result<Vec<GeneratedImage>, String> {
        let model = request.model.clone().unwrap_or_else(|| "gemini-2.5-flash-image".to_string());
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            model
        );
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": request.prompt}]}],
            "generationConfig": {"responseModalities": ["IMAGE"], "candidateCount": request.max_images.max(1)},
        });
        let client = crate::airborne::provider::common::shared_http_client();
        let resp = client
            .post(&url)
            .header("x-goog-api-key", &request.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        let value: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!("{} {}", status.as_u16(), value));
        }

        let mut images = Vec::new();
        for candidate in value["candidates"].as_array().cloned().unwrap_or_default() {
            for part in candidate["content"]["parts"].as_array().cloned().unwrap_or_default() {
                if let Some(inline) = part.get("inlineData") {
                    let mime = inline["mimeType"].as_str().unwrap_or("image/png");
                    let b64 = inline["data"].as_str().unwrap_or("");
                    let raw = decode_inline_image(b64)?;
                    let (bytes, mime_type) = if mime == "image/png" {
                        (png_to_jpeg(&raw)?, "image/jpeg".to_string())
                    } else {
                        (raw, mime.to_string())
                    };
                    images.push(GeneratedImage {
                        bytes,
                        mime_type,
                        width: 0,
                        height: 0,
                        alt_text: request.prompt.clone(),
                    });
                }
            }
        }
        Ok(images)
    }
}

pub struct OpenAiImageGenerator;

#[async_trait]
impl ImageGenerator for OpenAiImageGenerator {
    fn provider(&self) -> &str {
        "openai"
    }

    async fn generate(&self, request: &ImageGenRequest) -> Result<Vec<GeneratedImage>, String> {
        let model = request.model.clone().unwrap_or_else(|| "gpt-image-1".to_string());
        let url = "https://api.openai.com/v1/images/generations";
        let body = serde_json::json!({
            "model": model,
            "prompt": request.prompt,
            "n": request.max_images.max(1),
            "response_format": "b64_json",
        });
        let client = crate::airborne::provider::common::shared_http_client();
        let resp = client
            .post(url)
            .bearer_auth(&request.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        let value: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!("{} {}", status.as_u16(), value));
        }

        let mut images = Vec::new();
        for item in value["data"].as_array().cloned().unwrap_or_default() {
            if let Some(b64) = item["b64_json"].as_str() {
                let bytes = decode_inline_image(b64)?;
                images.push(GeneratedImage {
                    bytes,
                    mime_type: "image/png".to_string(),
                    width: 0,
                    height: 0,
                    alt_text: request.prompt.clone(),
                });
            }
        }
        Ok(images)
    }
}

/// Select gemini by default, openai on explicit configuration (§4.11).
pub fn select_generator(configured_provider: &str) -> Box<dyn ImageGenerator> {
    match configured_provider {
        "openai" => Box::new(OpenAiImageGenerator),
        _ => Box::new(GeminiImageGenerator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_inline_image_strips_data_uri_prefix() {
        let payload = "data:image/png;base64,aGVsbG8=";
        assert_eq!(decode_inline_image(payload).unwrap(), b"hello");
    }

    #[test]
    fn decode_inline_image_accepts_bare_base64() {
        assert_eq!(decode_inline_image("aGVsbG8=").unwrap(), b"hello");
    }

    #[test]
    fn select_generator_defaults_to_gemini() {
        assert_eq!(select_generator("").provider(), "gemini");
        assert_eq!(select_generator("unknown").provider(), "gemini");
    }

    #[test]
    fn select_generator_honors_openai_override() {
        assert_eq!(select_generator("openai").provider(), "openai");
    }

    #[test]
    fn png_to_jpeg_round_trips_a_real_png() {
        let mut png_bytes = Vec::new();
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 0]));
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut png_bytes), image::ImageFormat::Png)
            .unwrap();
        let jpeg_bytes = png_to_jpeg(&png_bytes).unwrap();
        assert!(!jpeg_bytes.is_empty());
        assert!(image::load_from_memory_with_format(&jpeg_bytes, image::ImageFormat::Jpeg).is_ok());
    }
}
