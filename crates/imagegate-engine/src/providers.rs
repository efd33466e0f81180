//! Built-in provider adapters.
//!
//! Each adapter turns one prompt into one image and reports failures as
//! [`RawProviderError`] so classification happens in one place. Request
//! deadlines are owned by the resilience wrapper; the HTTP client timeout only
//! bounds how long an abandoned request thread can linger.

use std::collections::VecDeque;
use std::env;
use std::error::Error as StdError;
use std::io::{self, Cursor};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imagegate_contracts::errors::{
    parse_retry_after, truncate_text, NetworkCode, RawProviderError,
};
use reqwest::blocking::multipart::Form as MultipartForm;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::{GenerationResult, ImageProvider};

const BODY_MAX_CHARS: usize = 512;
const CLIENT_TIMEOUT_GRACE: Duration = Duration::from_secs(5);
const DRYRUN_SIZE: u32 = 256;

fn api_base(env_key: &str, default: &str) -> String {
    env::var(env_key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn http_client(deadline: Duration) -> Result<HttpClient> {
    HttpClient::builder()
        .timeout(deadline + CLIENT_TIMEOUT_GRACE)
        .user_agent(concat!("imagegate/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

pub struct DryrunProvider {
    deadline: Duration,
    scripted: Mutex<VecDeque<String>>,
}

impl DryrunProvider {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            scripted: Mutex::new(VecDeque::new()),
        }
    }

    /// Queues failures consumed one per call before any image is rendered.
    /// Each step is an HTTP status (`429`), a network code (`ECONNRESET`) or
    /// `hang`, which sleeps past the deadline.
    pub fn with_scripted_failures(self, steps: Vec<String>) -> Self {
        Self {
            scripted: Mutex::new(steps.into()),
            ..self
        }
    }

    fn next_step(&self) -> Option<String> {
        self.scripted
            .lock()
            .map(|mut steps| steps.pop_front())
            .unwrap_or(None)
    }
}

impl ImageProvider for DryrunProvider {
    fn provider_id(&self) -> &str {
        "dryrun"
    }

    fn deadline(&self) -> Duration {
        self.deadline
    }

    fn generate(&self, prompt: &str) -> Result<GenerationResult, RawProviderError> {
        if let Some(step) = self.next_step() {
            if step.eq_ignore_ascii_case("hang") {
                thread::sleep(self.deadline + Duration::from_secs(1));
            } else if let Ok(status) = step.parse::<u16>() {
                return Err(RawProviderError::http(
                    "dryrun",
                    status,
                    format!("scripted HTTP {status}"),
                ));
            } else {
                return Err(RawProviderError::network(
                    "dryrun",
                    NetworkCode::from_code(&step),
                    format!("scripted network failure {step}"),
                ));
            }
        }
        let image_bytes = render_dryrun_png(prompt, DRYRUN_SIZE)
            .map_err(|err| RawProviderError::other("dryrun", format!("{err:#}")))?;
        Ok(GenerationResult {
            image_bytes,
            content_type: "image/png".to_string(),
            provider_id: "dryrun".to_string(),
        })
    }
}

fn render_dryrun_png(prompt: &str, size: u32) -> Result<Vec<u8>> {
    let (r, g, b) = color_from_prompt(prompt);
    let mut image = RgbImage::new(size, size);
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut out, ImageFormat::Png)
        .context("failed to encode dryrun image")?;
    Ok(out.into_inner())
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(prompt.as_bytes());
    (digest[0], digest[1], digest[2])
}

pub struct OpenAiProvider {
    api_base: String,
    api_key: String,
    model: String,
    deadline: Duration,
    http: HttpClient,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: Option<String>, deadline: Duration) -> Result<Self> {
        Ok(Self {
            api_base: api_base("OPENAI_API_BASE", "https://api.openai.com/v1"),
            api_key,
            model: model.unwrap_or_else(|| "gpt-image-1".to_string()),
            deadline,
            http: http_client(deadline)?,
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn download_image(&self, url: &str) -> Result<GenerationResult, RawProviderError> {
        let response = self
            .http
            .get(url)
            .send()
            .map_err(|err| transport_error("openai", err))?;
        let response = check_status("openai", response)?;
        let header_type = content_type_header(&response);
        let bytes = response
            .bytes()
            .map_err(|err| transport_error("openai", err))?
            .to_vec();
        Ok(image_result("openai", bytes, header_type))
    }
}

impl ImageProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    fn deadline(&self) -> Duration {
        self.deadline
    }

    fn generate(&self, prompt: &str) -> Result<GenerationResult, RawProviderError> {
        let endpoint = format!("{}/images/generations", self.api_base);
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "n": 1,
            "size": "1024x1024",
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|err| transport_error("openai", err))?;
        let body = json_body("openai", check_status("openai", response)?)?;
        match extract_openai_image(&body) {
            Some(OpenAiImage::Inline(bytes)) => Ok(image_result("openai", bytes, None)),
            Some(OpenAiImage::Url(url)) => self.download_image(&url),
            None => Err(RawProviderError::other(
                "openai",
                format!("response carried no image: {}", truncate_text(&body.to_string(), BODY_MAX_CHARS)),
            )),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum OpenAiImage {
    Inline(Vec<u8>),
    Url(String),
}

fn extract_openai_image(payload: &Value) -> Option<OpenAiImage> {
    let first = payload.get("data").and_then(Value::as_array)?.first()?;
    if let Some(b64) = first.get("b64_json").and_then(Value::as_str) {
        return BASE64.decode(b64.trim()).ok().map(OpenAiImage::Inline);
    }
    first
        .get("url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|url| url.starts_with("http"))
        .map(|url| OpenAiImage::Url(url.to_string()))
}

pub struct StabilityProvider {
    api_base: String,
    api_key: String,
    deadline: Duration,
    http: HttpClient,
}

impl StabilityProvider {
    pub fn new(api_key: String, deadline: Duration) -> Result<Self> {
        Ok(Self {
            api_base: api_base("STABILITY_API_BASE", "https://api.stability.ai"),
            api_key,
            deadline,
            http: http_client(deadline)?,
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

impl ImageProvider for StabilityProvider {
    fn provider_id(&self) -> &str {
        "stability"
    }

    fn deadline(&self) -> Duration {
        self.deadline
    }

    fn generate(&self, prompt: &str) -> Result<GenerationResult, RawProviderError> {
        let endpoint = format!("{}/v2beta/stable-image/generate/core", self.api_base);
        let form = MultipartForm::new()
            .text("prompt", prompt.to_string())
            .text("output_format", "png");
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .header("Accept", "image/*")
            .multipart(form)
            .send()
            .map_err(|err| transport_error("stability", err))?;
        let response = check_status("stability", response)?;
        let header_type = content_type_header(&response);
        if header_type
            .as_deref()
            .map(|value| value.starts_with("image/"))
            .unwrap_or(false)
        {
            let bytes = response
                .bytes()
                .map_err(|err| transport_error("stability", err))?
                .to_vec();
            return Ok(image_result("stability", bytes, header_type));
        }
        let body = json_body("stability", response)?;
        body.get("image")
            .and_then(Value::as_str)
            .and_then(|b64| BASE64.decode(b64.trim()).ok())
            .map(|bytes| image_result("stability", bytes, None))
            .ok_or_else(|| {
                RawProviderError::other(
                    "stability",
                    format!("response carried no image: {}", truncate_text(&body.to_string(), BODY_MAX_CHARS)),
                )
            })
    }
}

pub struct GeminiProvider {
    api_base: String,
    api_key: String,
    model: String,
    deadline: Duration,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(api_key: String, model: Option<String>, deadline: Duration) -> Result<Self> {
        Ok(Self {
            api_base: api_base(
                "GEMINI_API_BASE",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            api_key,
            model: model.unwrap_or_else(|| "gemini-2.5-flash-image".to_string()),
            deadline,
            http: http_client(deadline)?,
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

impl ImageProvider for GeminiProvider {
    fn provider_id(&self) -> &str {
        "gemini"
    }

    fn deadline(&self) -> Duration {
        self.deadline
    }

    fn generate(&self, prompt: &str) -> Result<GenerationResult, RawProviderError> {
        let endpoint = format!("{}/models/{}:generateContent", self.api_base, self.model);
        let payload = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "responseModalities": ["IMAGE"] },
        });
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .map_err(|err| transport_error("gemini", err))?;
        let body = json_body("gemini", check_status("gemini", response)?)?;
        extract_gemini_image(&body)
            .map(|(bytes, mime)| image_result("gemini", bytes, mime))
            .ok_or_else(|| {
                RawProviderError::other(
                    "gemini",
                    format!("response carried no image: {}", truncate_text(&body.to_string(), BODY_MAX_CHARS)),
                )
            })
    }
}

fn extract_gemini_image(payload: &Value) -> Option<(Vec<u8>, Option<String>)> {
    let candidates = payload.get("candidates").and_then(Value::as_array)?;
    candidates
        .iter()
        .filter_map(|candidate| candidate.get("content")?.get("parts")?.as_array())
        .flatten()
        .filter_map(|part| part.get("inlineData").or_else(|| part.get("inline_data")))
        .find_map(|inline| {
            let data = inline.get("data").and_then(Value::as_str)?;
            let bytes = BASE64.decode(data.trim()).ok()?;
            let mime = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            Some((bytes, mime))
        })
}

fn image_result(provider: &str, bytes: Vec<u8>, declared: Option<String>) -> GenerationResult {
    let content_type = sniff_content_type(&bytes)
        .map(str::to_string)
        .or(declared)
        .unwrap_or_else(|| "image/png".to_string());
    GenerationResult {
        image_bytes: bytes,
        content_type,
        provider_id: provider.to_string(),
    }
}

fn content_type_header(response: &HttpResponse) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase())
}

/// Identifies common image formats from their magic bytes.
pub fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        return Some("image/png");
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(b"GIF8") {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    None
}

fn check_status(provider: &str, response: HttpResponse) -> Result<HttpResponse, RawProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().unwrap_or_default();
    Err(RawProviderError::http(
        provider,
        code,
        format!("HTTP {code}: {}", truncate_text(&body, BODY_MAX_CHARS)),
    )
    .with_retry_after(retry_after))
}

fn json_body(provider: &str, response: HttpResponse) -> Result<Value, RawProviderError> {
    let body = response
        .text()
        .map_err(|err| transport_error(provider, err))?;
    serde_json::from_str(&body).map_err(|err| {
        RawProviderError::other(
            provider,
            format!("invalid JSON payload ({err}): {}", truncate_text(&body, BODY_MAX_CHARS)),
        )
    })
}

fn transport_error(provider: &str, err: reqwest::Error) -> RawProviderError {
    let message = error_chain_text(&err);
    if err.is_timeout() {
        return RawProviderError::network(provider, NetworkCode::TimedOut, message);
    }
    let lowered = message.to_ascii_lowercase();
    if err.is_connect() && (lowered.contains("dns error") || lowered.contains("failed to lookup")) {
        return RawProviderError::network(provider, NetworkCode::DnsFailure, message);
    }
    if let Some(kind) = io_error_kind(&err) {
        return RawProviderError::network(provider, NetworkCode::from_io_kind(kind), message);
    }
    if err.is_connect() {
        return RawProviderError::network(provider, NetworkCode::ConnectionRefused, message);
    }
    RawProviderError::other(provider, message)
}

fn io_error_kind(err: &reqwest::Error) -> Option<io::ErrorKind> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = cause.source();
    }
    None
}

fn error_chain_text(err: &reqwest::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if parts.last().map(|last| last != &text).unwrap_or(true) {
            parts.push(text);
        }
        source = cause.source();
    }
    truncate_text(&parts.join(": "), BODY_MAX_CHARS)
}
