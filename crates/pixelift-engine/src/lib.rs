use std::env;
use std::fmt;
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageFormat, Rgb, RgbImage};
use pixelift_contracts::chat::{render_prompt, ChatTurn};
use pixelift_contracts::events::{RequestLog, RequestStage};
use pixelift_contracts::models::ModelRegistry;
use pixelift_contracts::uploads::{TempUpload, UploadStore};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::ACCEPT;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

const RESTORE_UPLOAD_WIDTH: u32 = 1000;
const RESTORE_JPEG_QUALITY: u8 = 100;
const TRANSFORM_UPLOAD_WIDTH: u32 = 800;
const STICKER_UPLOAD_WIDTH: u32 = 800;
const STICKER_JPEG_QUALITY: u8 = 60;

/// How long a chat request waits for the streamed reply before giving up.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

const CHAT_SYSTEM_PROMPT: &str = "Eres un asistente útil. Mantén el contexto del historial de la conversación proporcionado. Responde en el mismo idioma que el usuario.";
const CHAT_PROMPT_TEMPLATE: &str = "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n{system_prompt}<|eot_id|><|start_header_id|>user<|end_header_id|>\n\n{prompt}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n";

/// A finite, single-pass byte source. Draining consumes the value, so a
/// second read is a compile error rather than a runtime surprise.
pub struct ByteStream {
    reader: Box<dyn Read + Send>,
}

impl ByteStream {
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::from_reader(Cursor::new(bytes))
    }

    /// Chunks are replayed in order and concatenated by `drain`.
    pub fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
        let mut reader: Box<dyn Read + Send> = Box::new(io::empty());
        for chunk in chunks {
            reader = Box::new(reader.chain(Cursor::new(chunk)));
        }
        Self { reader }
    }

    pub fn drain(mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.reader.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("ByteStream(..)")
    }
}

/// One element of a sequence-shaped model output. Only the first element of
/// a sequence is ever meaningful.
#[derive(Debug)]
pub enum OutputItem {
    Url(String),
    Stream(ByteStream),
    Other(Value),
}

/// The shapes a finished inference job has been observed to return.
#[derive(Debug)]
pub enum InferenceOutput {
    Url(String),
    Items(Vec<OutputItem>),
    Fields(Map<String, Value>),
    Stream(ByteStream),
    Unrecognized(Value),
}

/// A ready-to-serve image: raw bytes plus the media type declared for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

impl ImagePayload {
    pub fn to_data_uri(&self) -> String {
        data_uri(&self.media_type, &self.bytes)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: u16,
    pub bytes: Vec<u8>,
}

pub trait UrlFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedBody>;
}

/// Plain GET fetcher for result URLs. Status interpretation belongs to the
/// normalizer, not here.
pub struct HttpFetcher {
    http: HttpClient,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedBody> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading result image ({url})"))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .context("failed reading result image bytes")?
            .to_vec();
        Ok(FetchedBody { status, bytes })
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("could not extract a result image from the model output")]
    UnrecognizedShape,
    #[error("result download failed with HTTP status {status}")]
    FetchFailed { status: u16 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Caller policy for the produced payload: the media type to declare (the
/// upstream content type is never inspected) and an optional re-encode
/// applied to the raw bytes before the payload is built.
pub struct NormalizeOptions<'a> {
    pub media_type: &'a str,
    pub transform: Option<&'a dyn Fn(Vec<u8>) -> Result<Vec<u8>>>,
}

impl NormalizeOptions<'_> {
    pub fn png() -> NormalizeOptions<'static> {
        NormalizeOptions {
            media_type: "image/png",
            transform: None,
        }
    }
}

/// Converts a finished job's output into a deliverable image payload.
///
/// Precedence is fixed: a bare URL, then the first element of a sequence
/// (URL or stream; anything else there fails even if later elements would
/// match), then an `image_url` field, then a bare stream. URL shapes cost
/// exactly one fetch; stream shapes one full drain. A payload is never
/// empty: an empty body reports `UnrecognizedShape` instead.
pub fn normalize_output(
    output: InferenceOutput,
    fetcher: &dyn UrlFetcher,
    options: &NormalizeOptions,
) -> Result<ImagePayload, NormalizeError> {
    match output {
        InferenceOutput::Url(url) => fetch_payload(&url, fetcher, options),
        InferenceOutput::Items(items) => match items.into_iter().next() {
            Some(OutputItem::Url(url)) => fetch_payload(&url, fetcher, options),
            Some(OutputItem::Stream(stream)) => stream_payload(stream, options),
            Some(OutputItem::Other(_)) | None => Err(NormalizeError::UnrecognizedShape),
        },
        InferenceOutput::Fields(fields) => {
            match fields.get("image_url").and_then(Value::as_str) {
                Some(url) => fetch_payload(url, fetcher, options),
                None => Err(NormalizeError::UnrecognizedShape),
            }
        }
        InferenceOutput::Stream(stream) => stream_payload(stream, options),
        InferenceOutput::Unrecognized(_) => Err(NormalizeError::UnrecognizedShape),
    }
}

fn fetch_payload(
    url: &str,
    fetcher: &dyn UrlFetcher,
    options: &NormalizeOptions,
) -> Result<ImagePayload, NormalizeError> {
    let body = fetcher.fetch(url)?;
    if !(200..300).contains(&body.status) {
        return Err(NormalizeError::FetchFailed {
            status: body.status,
        });
    }
    build_payload(body.bytes, options)
}

fn stream_payload(
    stream: ByteStream,
    options: &NormalizeOptions,
) -> Result<ImagePayload, NormalizeError> {
    let bytes = stream.drain().context("failed draining result stream")?;
    build_payload(bytes, options)
}

fn build_payload(
    bytes: Vec<u8>,
    options: &NormalizeOptions,
) -> Result<ImagePayload, NormalizeError> {
    let bytes = match options.transform {
        Some(transform) => transform(bytes).context("result re-encode failed")?,
        None => bytes,
    };
    if bytes.is_empty() {
        return Err(NormalizeError::UnrecognizedShape);
    }
    Ok(ImagePayload {
        bytes,
        media_type: options.media_type.to_string(),
    })
}

/// A rejected inference API call, kept in the error chain so callers can map
/// specific statuses to friendlier messages.
#[derive(Debug, Error)]
#[error("inference API request failed ({status}): {detail}")]
pub struct ApiFailure {
    pub status: u16,
    pub detail: String,
}

pub trait InferenceClient {
    fn run(&self, model: &str, input: Map<String, Value>) -> Result<InferenceOutput>;

    fn stream_reply(
        &self,
        model: &str,
        input: Map<String, Value>,
    ) -> Result<Box<dyn Iterator<Item = Result<String>> + Send>>;
}

const POLL_INTERVAL_SECONDS: f64 = 1.0;
const POLL_TIMEOUT_SECONDS: f64 = 120.0;

/// Client for the hosted prediction API.
pub struct ReplicateClient {
    api_base: String,
    http: HttpClient,
}

impl ReplicateClient {
    pub fn new() -> Self {
        Self {
            api_base: env::var("REPLICATE_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.replicate.com/v1".to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("REPLICATE_API_TOKEN")
    }

    fn predictions_endpoint(&self) -> String {
        format!("{}/predictions", self.api_base)
    }

    /// Versioned refs (`owner/name:version`) create predictions by version,
    /// unversioned refs by model name.
    fn prediction_payload(model: &str, input: Map<String, Value>, stream: bool) -> Map<String, Value> {
        let mut payload = Map::new();
        match model.rsplit_once(':') {
            Some((_, version)) if !version.is_empty() => {
                payload.insert("version".to_string(), Value::String(version.to_string()));
            }
            _ => {
                payload.insert("model".to_string(), Value::String(model.trim().to_string()));
            }
        }
        payload.insert("input".to_string(), Value::Object(input));
        if stream {
            payload.insert("stream".to_string(), Value::Bool(true));
        }
        payload
    }

    fn create_prediction(&self, api_key: &str, payload: &Value, wait: bool) -> Result<Value> {
        let endpoint = self.predictions_endpoint();
        let mut request = self.http.post(&endpoint).bearer_auth(api_key).json(payload);
        if wait {
            request = request.header("Prefer", "wait");
        }
        let response = request
            .send()
            .with_context(|| format!("Replicate request failed ({endpoint})"))?;
        response_json_or_error("Replicate", response)
    }

    fn poll_prediction(&self, poll_url: &str, api_key: &str) -> Result<Value> {
        let started = Instant::now();
        loop {
            let response = self
                .http
                .get(poll_url)
                .bearer_auth(api_key)
                .send()
                .with_context(|| format!("Replicate poll request failed ({poll_url})"))?;
            let payload = response_json_or_error("Replicate poll", response)?;
            let status = payload
                .get("status")
                .and_then(Value::as_str)
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or_default();
            if status == "succeeded" {
                return Ok(payload);
            }
            if matches!(status.as_str(), "failed" | "canceled") {
                bail!(
                    "Replicate prediction failed: {}",
                    truncate_text(&payload.to_string(), 512)
                );
            }
            if started.elapsed().as_secs_f64() >= POLL_TIMEOUT_SECONDS {
                bail!("Replicate polling timed out after {POLL_TIMEOUT_SECONDS:.1}s");
            }
            thread::sleep(Duration::from_secs_f64(POLL_INTERVAL_SECONDS));
        }
    }

    fn await_success(&self, api_key: &str, prediction: Value) -> Result<Value> {
        let status = prediction
            .get("status")
            .and_then(Value::as_str)
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        if status == "succeeded" {
            return Ok(prediction);
        }
        if matches!(status.as_str(), "starting" | "processing") {
            let poll_url = prediction
                .get("urls")
                .and_then(Value::as_object)
                .and_then(|obj| obj.get("get"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| anyhow!("Replicate prediction missing poll URL"))?;
            return self.poll_prediction(poll_url, api_key);
        }
        bail!(
            "Replicate prediction failed: {}",
            truncate_text(&prediction.to_string(), 512)
        );
    }
}

impl Default for ReplicateClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceClient for ReplicateClient {
    fn run(&self, model: &str, input: Map<String, Value>) -> Result<InferenceOutput> {
        let Some(api_key) = Self::api_key() else {
            bail!("REPLICATE_API_TOKEN not set");
        };
        let payload = Value::Object(Self::prediction_payload(model, input, false));
        let prediction = self.create_prediction(&api_key, &payload, true)?;
        let mut prediction = self.await_success(&api_key, prediction)?;
        let output = prediction
            .get_mut("output")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(classify_output(output))
    }

    fn stream_reply(
        &self,
        model: &str,
        input: Map<String, Value>,
    ) -> Result<Box<dyn Iterator<Item = Result<String>> + Send>> {
        let Some(api_key) = Self::api_key() else {
            bail!("REPLICATE_API_TOKEN not set");
        };
        let payload = Value::Object(Self::prediction_payload(model, input, true));
        let prediction = self.create_prediction(&api_key, &payload, false)?;
        let stream_url = prediction
            .get("urls")
            .and_then(Value::as_object)
            .and_then(|obj| obj.get("stream"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("Replicate prediction missing stream URL"))?;
        let response = self
            .http
            .get(stream_url)
            .bearer_auth(&api_key)
            .header(ACCEPT, "text/event-stream")
            .send()
            .with_context(|| format!("Replicate stream request failed ({stream_url})"))?;
        let response = ensure_success("Replicate stream", response)?;
        Ok(Box::new(SseTokenStream::new(BufReader::new(response))))
    }
}

/// Server-sent-event reader over a prediction's stream URL. Yields one token
/// per `output` event, stops at `done`, and surfaces `error` events.
struct SseTokenStream<R: BufRead> {
    lines: io::Lines<R>,
    event: String,
    data: Vec<String>,
    done: bool,
}

impl<R: BufRead> SseTokenStream<R> {
    fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            event: String::new(),
            data: Vec::new(),
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for SseTokenStream<R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let line = match self.lines.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(
                        anyhow::Error::new(err).context("Replicate stream read failed")
                    ));
                }
                Some(Ok(line)) => line,
            };
            if line.is_empty() {
                let event = std::mem::take(&mut self.event);
                let data = std::mem::take(&mut self.data).join("\n");
                match event.as_str() {
                    "output" => return Some(Ok(data)),
                    "done" => {
                        self.done = true;
                        return None;
                    }
                    "error" => {
                        self.done = true;
                        return Some(Err(anyhow!(
                            "Replicate stream reported an error: {}",
                            truncate_text(&data, 512)
                        )));
                    }
                    _ => continue,
                }
            } else if let Some(rest) = line.strip_prefix("event:") {
                self.event = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data
                    .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
        }
    }
}

/// Maps a prediction's `output` JSON into the shape union the normalizer
/// consumes. Inline `data:` URIs are the wire carrier for byte streams, so
/// they classify as streams rather than fetchable URLs.
pub fn classify_output(value: Value) -> InferenceOutput {
    match value {
        Value::String(text) => match decode_data_uri(&text) {
            Some(bytes) => InferenceOutput::Stream(ByteStream::from_bytes(bytes)),
            None => InferenceOutput::Url(text),
        },
        Value::Array(rows) => {
            InferenceOutput::Items(rows.into_iter().map(classify_item).collect())
        }
        Value::Object(fields) => InferenceOutput::Fields(fields),
        other => InferenceOutput::Unrecognized(other),
    }
}

fn classify_item(value: Value) -> OutputItem {
    match value {
        Value::String(text) => match decode_data_uri(&text) {
            Some(bytes) => OutputItem::Stream(ByteStream::from_bytes(bytes)),
            None => OutputItem::Url(text),
        },
        other => OutputItem::Other(other),
    }
}

pub fn decode_data_uri(text: &str) -> Option<Vec<u8>> {
    let rest = text.strip_prefix("data:")?;
    let (_, payload) = rest.split_once(";base64,")?;
    BASE64.decode(payload.trim()).ok()
}

pub fn data_uri(media_type: &str, bytes: &[u8]) -> String {
    format!("data:{media_type};base64,{}", BASE64.encode(bytes))
}

/// Offline stand-in for the hosted API: returns a deterministic flat-color
/// image keyed to the prompt, and canned chat tokens.
pub struct DryrunClient;

impl InferenceClient for DryrunClient {
    fn run(&self, _model: &str, input: Map<String, Value>) -> Result<InferenceOutput> {
        let prompt = input
            .get("prompt")
            .or_else(|| input.get("img"))
            .or_else(|| input.get("image"))
            .and_then(Value::as_str)
            .unwrap_or("dryrun");
        let bytes = dryrun_image_bytes(prompt)?;
        Ok(InferenceOutput::Stream(ByteStream::from_bytes(bytes)))
    }

    fn stream_reply(
        &self,
        _model: &str,
        input: Map<String, Value>,
    ) -> Result<Box<dyn Iterator<Item = Result<String>> + Send>> {
        let chars = input
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .chars()
            .count();
        let tokens: Vec<Result<String>> = vec![
            Ok("(dryrun)".to_string()),
            Ok(format!(" echoing a prompt of {chars} chars")),
        ];
        Ok(Box::new(tokens.into_iter()))
    }
}

fn dryrun_image_bytes(prompt: &str) -> Result<Vec<u8>> {
    let (r, g, b) = color_from_prompt(prompt);
    let mut image = RgbImage::new(64, 64);
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode dryrun image")?;
    Ok(bytes)
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

/// Target encoding for a preprocessed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    Jpeg { quality: u8 },
    WebP,
}

/// Scales an upload to the given width (aspect preserved, small inputs are
/// enlarged) and recompresses it, returning the bytes and their media type.
pub fn shrink_upload(
    bytes: &[u8],
    target_width: u32,
    format: TargetFormat,
) -> Result<(Vec<u8>, &'static str)> {
    let image = image::load_from_memory(bytes).context("could not decode the uploaded image")?;
    let width = target_width.max(1);
    let resized = if image.width() == width {
        image
    } else {
        let height = ((u64::from(image.height()) * u64::from(width)) / u64::from(image.width()))
            .max(1) as u32;
        image.resize_exact(width, height, FilterType::Triangle)
    };
    match format {
        TargetFormat::Jpeg { quality } => {
            let rgb = resized.to_rgb8();
            let mut out = Vec::new();
            let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
            encoder
                .encode_image(&DynamicImage::ImageRgb8(rgb))
                .context("failed to encode upload as JPEG")?;
            Ok((out, "image/jpeg"))
        }
        TargetFormat::WebP => {
            let rgba = resized.to_rgba8();
            let mut out = Vec::new();
            let encoder = WebPEncoder::new_lossless(&mut out);
            encoder
                .encode(
                    rgba.as_raw(),
                    rgba.width(),
                    rgba.height(),
                    ExtendedColorType::Rgba8,
                )
                .context("failed to encode upload as WebP")?;
            Ok((out, "image/webp"))
        }
    }
}

/// Re-encodes fetched result bytes to WebP without resizing.
pub fn reencode_webp(bytes: &[u8]) -> Result<Vec<u8>> {
    let image = image::load_from_memory(bytes).context("could not decode the result image")?;
    let rgba = image.to_rgba8();
    let mut out = Vec::new();
    let encoder = WebPEncoder::new_lossless(&mut out);
    encoder
        .encode(
            rgba.as_raw(),
            rgba.width(),
            rgba.height(),
            ExtendedColorType::Rgba8,
        )
        .context("failed to re-encode result as WebP")?;
    Ok(out)
}

/// How a finished payload is handed back to the page: inlined as a data URI
/// or persisted under the upload store and referenced by public path.
#[derive(Debug, Clone)]
pub enum Delivery {
    Inline {
        data_uri: String,
        media_type: String,
    },
    Stored {
        file_name: String,
        public_path: String,
        path: PathBuf,
        media_type: String,
    },
}

impl Delivery {
    /// The value the page embeds as its `outputImage`.
    pub fn output_image(&self) -> &str {
        match self {
            Delivery::Inline { data_uri, .. } => data_uri,
            Delivery::Stored { public_path, .. } => public_path,
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            Delivery::Inline { media_type, .. } => media_type,
            Delivery::Stored { media_type, .. } => media_type,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnhanceOptions {
    pub upscale: Option<u32>,
    pub face_upsample: Option<bool>,
    pub background_enhance: Option<bool>,
    pub fidelity: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct StudioConfig {
    pub uploads_root: PathBuf,
    pub events_path: Option<PathBuf>,
}

/// The studio: one method per page operation. Each call is independent and
/// runs validate, preprocess, pinned model, normalize, deliver in order.
pub struct Studio {
    client: Box<dyn InferenceClient>,
    fetcher: Box<dyn UrlFetcher>,
    uploads: UploadStore,
    models: ModelRegistry,
    events_path: Option<PathBuf>,
    reply_timeout: Duration,
}

impl Studio {
    pub fn new(config: StudioConfig) -> Self {
        Self::with_parts(
            config,
            Box::new(ReplicateClient::new()),
            Box::new(HttpFetcher::new()),
            ModelRegistry::default(),
        )
    }

    pub fn dryrun(config: StudioConfig) -> Self {
        Self::with_parts(
            config,
            Box::new(DryrunClient),
            Box::new(HttpFetcher::new()),
            ModelRegistry::default(),
        )
    }

    pub fn with_parts(
        config: StudioConfig,
        client: Box<dyn InferenceClient>,
        fetcher: Box<dyn UrlFetcher>,
        models: ModelRegistry,
    ) -> Self {
        Self {
            client,
            fetcher,
            uploads: UploadStore::new(config.uploads_root),
            models,
            events_path: config.events_path,
            reply_timeout: REPLY_TIMEOUT,
        }
    }

    pub fn set_reply_timeout(&mut self, timeout: Duration) {
        self.reply_timeout = timeout;
    }

    pub fn uploads(&self) -> &UploadStore {
        &self.uploads
    }

    /// Face restoration: the result is persisted and referenced by its
    /// public path, so the comparison view can reload it later.
    pub fn restore(&self, upload: &[u8]) -> Result<Delivery> {
        let log = self.request_log("restore");
        emit(
            log.as_ref(),
            RequestStage::Received,
            json!({ "upload_bytes": upload.len() }),
        );
        let outcome = self.restore_inner(upload, log.as_ref());
        report(log.as_ref(), outcome)
    }

    fn restore_inner(&self, upload: &[u8], log: Option<&RequestLog>) -> Result<Delivery> {
        if upload.is_empty() {
            bail!("no image was provided");
        }
        let (resized, media_type) = shrink_upload(
            upload,
            RESTORE_UPLOAD_WIDTH,
            TargetFormat::Jpeg {
                quality: RESTORE_JPEG_QUALITY,
            },
        )?;
        emit(
            log,
            RequestStage::Preprocessed,
            json!({
                "width": RESTORE_UPLOAD_WIDTH,
                "media_type": media_type,
                "bytes": resized.len(),
            }),
        );
        let model = self.model("restore")?;
        let input = map_object(json!({
            "img": data_uri(media_type, &resized),
            "scale": 2,
            "version": "v1.4",
        }));
        let output = self.client.run(&model, input)?;
        emit(log, RequestStage::ModelCompleted, json!({ "model": model }));
        let payload = normalize_output(output, self.fetcher.as_ref(), &NormalizeOptions::png())?;
        let stored = self.uploads.save(&payload.bytes, "png")?;
        emit(
            log,
            RequestStage::Delivered,
            json!({
                "media_type": payload.media_type,
                "bytes": payload.bytes.len(),
                "public_path": stored.public_path,
            }),
        );
        Ok(Delivery::Stored {
            file_name: stored.file_name,
            public_path: stored.public_path,
            path: stored.path,
            media_type: payload.media_type,
        })
    }

    /// Text-to-image generation, delivered inline.
    pub fn generate(&self, prompt: &str) -> Result<Delivery> {
        let log = self.request_log("generate");
        emit(
            log.as_ref(),
            RequestStage::Received,
            json!({ "prompt_chars": prompt.chars().count() }),
        );
        let outcome = self.generate_inner(prompt, log.as_ref());
        report(log.as_ref(), outcome)
    }

    fn generate_inner(&self, prompt: &str, log: Option<&RequestLog>) -> Result<Delivery> {
        if prompt.trim().is_empty() {
            bail!("no prompt was provided");
        }
        let model = self.model("generate")?;
        let input = map_object(json!({
            "width": 1024,
            "height": 1024,
            "prompt": prompt,
            "scheduler": "K_EULER",
            "num_outputs": 1,
            "guidance_scale": 0,
            "negative_prompt": "worst quality, low quality",
            "num_inference_steps": 4,
        }));
        let output = self.client.run(&model, input)?;
        emit(log, RequestStage::ModelCompleted, json!({ "model": model }));
        let payload = normalize_output(output, self.fetcher.as_ref(), &NormalizeOptions::png())?;
        emit(
            log,
            RequestStage::Delivered,
            json!({
                "media_type": payload.media_type,
                "bytes": payload.bytes.len(),
            }),
        );
        Ok(Delivery::Inline {
            data_uri: payload.to_data_uri(),
            media_type: payload.media_type,
        })
    }

    /// Prompt-guided image editing. The preprocessed upload is mirrored to a
    /// temp file for the request's duration; the result is re-encoded to
    /// WebP and delivered inline.
    pub fn transform(&self, upload: &[u8], upload_name: &str, prompt: &str) -> Result<Delivery> {
        let log = self.request_log("transform");
        emit(
            log.as_ref(),
            RequestStage::Received,
            json!({
                "upload_bytes": upload.len(),
                "prompt_chars": prompt.chars().count(),
            }),
        );
        let outcome = self.transform_inner(upload, upload_name, prompt, log.as_ref());
        report(log.as_ref(), outcome)
    }

    fn transform_inner(
        &self,
        upload: &[u8],
        upload_name: &str,
        prompt: &str,
        log: Option<&RequestLog>,
    ) -> Result<Delivery> {
        if upload.is_empty() {
            bail!("no image was provided");
        }
        if prompt.trim().is_empty() {
            bail!("no prompt was provided");
        }
        let (resized, media_type) =
            shrink_upload(upload, TRANSFORM_UPLOAD_WIDTH, TargetFormat::WebP)?;
        // Dropped on every exit path of this request, success or error.
        let _scratch = TempUpload::create(&resized, upload_name)?;
        emit(
            log,
            RequestStage::Preprocessed,
            json!({
                "width": TRANSFORM_UPLOAD_WIDTH,
                "media_type": media_type,
                "bytes": resized.len(),
            }),
        );
        let model = self.model("transform")?;
        let input = map_object(json!({
            "image": data_uri(media_type, &resized),
            "prompt": prompt,
            "scheduler": "K_EULER_ANCESTRAL",
            "num_outputs": 1,
            "guidance_scale": 7.5,
            "num_inference_steps": 100,
            "image_guidance_scale": 1.5,
        }));
        let output = self.client.run(&model, input)?;
        emit(log, RequestStage::ModelCompleted, json!({ "model": model }));
        let recode = |bytes: Vec<u8>| reencode_webp(&bytes);
        let options = NormalizeOptions {
            media_type: "image/webp",
            transform: Some(&recode),
        };
        let payload = normalize_output(output, self.fetcher.as_ref(), &options)?;
        emit(
            log,
            RequestStage::Delivered,
            json!({
                "media_type": payload.media_type,
                "bytes": payload.bytes.len(),
            }),
        );
        Ok(Delivery::Inline {
            data_uri: payload.to_data_uri(),
            media_type: payload.media_type,
        })
    }

    /// Face-to-sticker, delivered inline.
    pub fn sticker(&self, upload: &[u8]) -> Result<Delivery> {
        let log = self.request_log("sticker");
        emit(
            log.as_ref(),
            RequestStage::Received,
            json!({ "upload_bytes": upload.len() }),
        );
        let outcome = self.sticker_inner(upload, log.as_ref());
        report(log.as_ref(), outcome)
    }

    fn sticker_inner(&self, upload: &[u8], log: Option<&RequestLog>) -> Result<Delivery> {
        if upload.is_empty() {
            bail!("no image was provided");
        }
        let (resized, media_type) = shrink_upload(
            upload,
            STICKER_UPLOAD_WIDTH,
            TargetFormat::Jpeg {
                quality: STICKER_JPEG_QUALITY,
            },
        )?;
        emit(
            log,
            RequestStage::Preprocessed,
            json!({
                "width": STICKER_UPLOAD_WIDTH,
                "media_type": media_type,
                "bytes": resized.len(),
            }),
        );
        let model = self.model("sticker")?;
        let input = map_object(json!({
            "image": data_uri(media_type, &resized),
            "steps": 15,
            "width": 800,
            "height": 800,
            "prompt": "sticker",
            "upscale": false,
            "upscale_steps": 5,
            "negative_prompt": "",
            "prompt_strength": 4.0,
            "ip_adapter_noise": 0.4,
            "ip_adapter_weight": 0.1,
            "instant_id_strength": 0.6,
        }));
        let output = self.client.run(&model, input)?;
        emit(log, RequestStage::ModelCompleted, json!({ "model": model }));
        let payload = normalize_output(output, self.fetcher.as_ref(), &NormalizeOptions::png())?;
        emit(
            log,
            RequestStage::Delivered,
            json!({
                "media_type": payload.media_type,
                "bytes": payload.bytes.len(),
            }),
        );
        Ok(Delivery::Inline {
            data_uri: payload.to_data_uri(),
            media_type: payload.media_type,
        })
    }

    /// CodeFormer enhancement of an already-hosted image. This model's
    /// contract is narrower: only a plain URL output is accepted, and the
    /// URL itself is the result.
    pub fn enhance(&self, image_url: &str, options: &EnhanceOptions) -> Result<String> {
        let log = self.request_log("enhance");
        emit(
            log.as_ref(),
            RequestStage::Received,
            json!({ "image_url": image_url }),
        );
        let outcome = self.enhance_inner(image_url, options, log.as_ref());
        report(log.as_ref(), outcome)
    }

    fn enhance_inner(
        &self,
        image_url: &str,
        options: &EnhanceOptions,
        log: Option<&RequestLog>,
    ) -> Result<String> {
        if image_url.trim().is_empty() {
            bail!("no image URL was provided");
        }
        let model = self.model("enhance")?;
        let input = map_object(json!({
            "image": image_url,
            "upscale": options.upscale.unwrap_or(2),
            "face_upsample": options.face_upsample.unwrap_or(true),
            "background_enhance": options.background_enhance.unwrap_or(true),
            "codeformer_fidelity": options.fidelity.unwrap_or(0.1),
        }));
        let output = self.client.run(&model, input)?;
        emit(log, RequestStage::ModelCompleted, json!({ "model": model }));
        let InferenceOutput::Url(url) = output else {
            bail!("unexpected output format from the enhance model");
        };
        emit(log, RequestStage::Delivered, json!({ "output_url": url }));
        Ok(url)
    }

    /// Chat assistant reply: streamed tokens concatenated, the whole stream
    /// raced against the reply timeout. The losing stream is not cancelled;
    /// its remaining tokens are simply never received.
    pub fn chat(&self, message: &str, history: &[ChatTurn]) -> Result<String> {
        let log = self.request_log("chat");
        emit(
            log.as_ref(),
            RequestStage::Received,
            json!({
                "message_chars": message.chars().count(),
                "history_turns": history.len(),
            }),
        );
        let outcome = self.chat_inner(message, history, log.as_ref());
        report(log.as_ref(), outcome)
    }

    fn chat_inner(
        &self,
        message: &str,
        history: &[ChatTurn],
        log: Option<&RequestLog>,
    ) -> Result<String> {
        if message.trim().is_empty() {
            bail!("no message was provided");
        }
        let model = self.model("chat")?;
        let input = map_object(json!({
            "top_k": 0,
            "top_p": 0.95,
            "prompt": render_prompt(history, message),
            "max_tokens": 512,
            "temperature": 0.7,
            "system_prompt": CHAT_SYSTEM_PROMPT,
            "length_penalty": 1,
            "max_new_tokens": 512,
            "stop_sequences": "<|end_of_text|>,<|eot_id|>",
            "prompt_template": CHAT_PROMPT_TEMPLATE,
            "presence_penalty": 0,
            "log_performance_metrics": false,
        }));
        let tokens = self
            .client
            .stream_reply(&model, input)
            .map_err(map_api_failure)?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for token in tokens {
                if tx.send(token).is_err() {
                    break;
                }
            }
        });

        let started = Instant::now();
        let mut reply = String::new();
        loop {
            let Some(remaining) = self.reply_timeout.checked_sub(started.elapsed()) else {
                bail!("the model took too long to reply; try again");
            };
            match rx.recv_timeout(remaining) {
                Ok(Ok(token)) => reply.push_str(&token),
                Ok(Err(err)) => return Err(map_api_failure(err)),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    bail!("the model took too long to reply; try again");
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        if reply.trim().is_empty() {
            bail!("the model returned an empty reply; try again");
        }
        emit(
            log,
            RequestStage::Delivered,
            json!({ "model": model, "reply_chars": reply.chars().count() }),
        );
        Ok(reply)
    }

    fn model(&self, capability: &str) -> Result<String> {
        self.models.resolve(capability).map_err(|err| anyhow!(err))
    }

    fn request_log(&self, op: &str) -> Option<RequestLog> {
        self.events_path
            .as_ref()
            .map(|path| RequestLog::new(path, op, Uuid::new_v4().to_string()))
    }
}

fn report<T>(log: Option<&RequestLog>, outcome: Result<T>) -> Result<T> {
    if let Err(err) = &outcome {
        emit(
            log,
            RequestStage::Failed,
            json!({ "error": error_chain_text(err, 512) }),
        );
    }
    outcome
}

fn emit(log: Option<&RequestLog>, stage: RequestStage, payload: Value) {
    if let Some(log) = log {
        let _ = log.emit(stage, map_object(payload));
    }
}

fn map_api_failure(err: anyhow::Error) -> anyhow::Error {
    let Some(failure) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ApiFailure>())
    else {
        return err;
    };
    match failure.status {
        401 => anyhow!("invalid API token"),
        422 => anyhow!(
            "invalid model version or permission: {}",
            failure.detail.clone()
        ),
        _ => err,
    }
}

fn ensure_success(what: &str, response: HttpResponse) -> Result<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let body = response.text().unwrap_or_default();
    Err(anyhow::Error::new(ApiFailure {
        status: code,
        detail: truncate_text(&body, 512),
    })
    .context(format!("{what} request was rejected")))
}

fn response_json_or_error(what: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{what} response body read failed"))?;
    if !status.is_success() {
        return Err(anyhow::Error::new(ApiFailure {
            status: code,
            detail: truncate_text(&body, 512),
        })
        .context(format!("{what} request was rejected")));
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{what} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
