// THEORY:
// The classifier is an external collaborator. The engine knows nothing about model
// loading, inference backends or hardware acceleration; it only relies on the narrow
// `detect(frame) -> [(label, confidence)]` contract defined here.
//
// The port is an awaitable call made once per frame, in stream order. Frames are
// never pipelined against it: if classification is slower than the camera, frames
// are simply not pulled any faster, so no backlog ever builds up.
//
// `HttpClassifier` is the adapter the recorder binary ships with. It sends each frame
// as a JPEG to an inference server and reads back a JSON list of detections.

use crate::error::{Result, SentryError};
use crate::frame::{CHANNELS, Frame};
use image::ExtendedColorType;
use image::ImageEncoder;
use image::codecs::jpeg::JpegEncoder;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_JPEG_QUALITY: u8 = 85;

/// One labelled object the classifier reported for a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(alias = "class")]
    pub label: String,
    #[serde(alias = "conf")]
    pub confidence: f32,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// The classifier port consumed by the session supervisor.
#[allow(async_fn_in_trait)]
pub trait Classifier {
    /// Returns every detection for a single frame. Must not retain the frame.
    async fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Releases the model or connection behind the port. Called once, at shutdown.
    async fn release(&mut self) {}
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Parses the inference server's `{"detections": [...]}` body.
pub fn parse_detections(body: &[u8]) -> Result<Vec<Detection>> {
    let response: DetectResponse = serde_json::from_slice(body)
        .map_err(|e| SentryError::Classifier(format!("malformed classifier response: {e}")))?;
    Ok(response.detections)
}

/// Encodes a BGR24 frame as a JPEG.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let expected = frame.width as usize * frame.height as usize * CHANNELS;
    if frame.data.len() != expected {
        return Err(SentryError::Classifier(format!(
            "frame {} holds {} bytes, expected {} for {}x{}",
            frame.index,
            frame.data.len(),
            expected,
            frame.width,
            frame.height
        )));
    }

    let rgb = frame.to_rgb();
    let mut jpeg = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    encoder
        .write_image(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| SentryError::Classifier(format!("JPEG encoding failed: {e}")))?;
    Ok(jpeg)
}

/// Classifier port backed by an HTTP inference server.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SentryError::Configuration(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Classifier for HttpClassifier {
    async fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let jpeg = encode_jpeg(frame, DEFAULT_JPEG_QUALITY)?;
        let part = Part::bytes(jpeg)
            .file_name(format!("frame_{}.jpg", frame.index))
            .mime_str("image/jpeg")
            .map_err(|e| SentryError::Classifier(e.to_string()))?;
        let form = Form::new()
            .part("image", part)
            .text("frame_index", frame.index.to_string());

        let resp = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SentryError::Classifier(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(SentryError::Classifier(format!(
                "classifier responded with {}",
                resp.status()
            )));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| SentryError::Classifier(format!("cannot read response: {e}")))?;
        parse_detections(&body)
    }

    async fn release(&mut self) {
        tracing::debug!(endpoint = %self.endpoint, "HTTP classifier released");
    }
}
