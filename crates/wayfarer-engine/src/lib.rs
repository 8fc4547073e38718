use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use wayfarer_contracts::compass::normalize_heading;
use wayfarer_contracts::decision::{decision_from_answer, extract_final_answer, Extraction};
use wayfarer_contracts::events::{EventPayload, EventWriter};
use wayfarer_contracts::links::{format_options, rank_directions};
use wayfarer_contracts::{new_session_id, BridgeState, Direction, PendingCommand, VisitedSet};

const DEFAULT_CHAT_API_BASE: &str = "https://api.dify.ai/v1";
const DEFAULT_BRIDGE_URL: &str = "http://localhost:3001";
const DEFAULT_USER: &str = "wayfarer";

const BRIDGE_IMAGE_PATH: &str = "/api/current-streetview";
const BRIDGE_LINKS_PATH: &str = "/api/current-links";
const BRIDGE_CONTROL_PATH: &str = "/api/streetview-control";

/// Raw image payload exchanged with collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl ImageBytes {
    pub fn sha256_hex(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        hex::encode(hasher.finalize())
    }

    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_deref() {
            Some("image/png") => "png",
            Some("image/webp") => "webp",
            Some("image/gif") => "gif",
            _ => "jpg",
        }
    }

    /// Parses a `data:image/...;base64,...` URL as published by the viewer.
    pub fn from_data_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| anyhow!("not a data URL"))?;
        let (mime_type, payload) = rest
            .split_once(";base64,")
            .ok_or_else(|| anyhow!("data URL is not base64 encoded"))?;
        if !mime_type.starts_with("image/") {
            bail!("data URL carries '{mime_type}', expected an image");
        }
        let bytes = BASE64
            .decode(payload.trim())
            .context("invalid base64 in data URL")?;
        Ok(Self {
            bytes,
            mime_type: Some(mime_type.to_string()),
        })
    }

    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type.as_deref().unwrap_or("image/jpeg"),
            BASE64.encode(&self.bytes)
        )
    }
}

/// Supplies the latest panorama frame. Absence is a normal
/// "not yet available" state, not an error.
pub trait ImageSupplier: Send + Sync {
    fn current_image(&self) -> Result<Option<ImageBytes>>;
}

/// Supplies the navigable directions at the current viewpoint.
pub trait LinkSupplier: Send + Sync {
    fn current_directions(&self) -> Result<Vec<Direction>>;
}

/// Receives navigation commands produced by the guide.
pub trait CommandSink: Send + Sync {
    fn send_navigation(&self, pano_id: &str, heading: f64) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub query: String,
    pub user: String,
    pub upload_file_id: Option<String>,
}

/// Conversational backend: accepts an optional image upload and a chat query,
/// returns the raw streamed payload for the extractor to scan.
pub trait ChatTransport: Send + Sync {
    fn name(&self) -> &str;
    fn upload_image(&self, image: &ImageBytes, user: &str) -> Result<String>;
    fn send_query(&self, request: &ChatRequest) -> Result<String>;
}

#[derive(Default)]
pub struct TransportRegistry {
    transports: BTreeMap<String, Box<dyn ChatTransport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: ChatTransport + 'static>(&mut self, transport: T) {
        self.transports
            .insert(transport.name().to_string(), Box::new(transport));
    }

    pub fn take(&mut self, name: &str) -> Option<Box<dyn ChatTransport>> {
        self.transports.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.transports.keys().cloned().collect()
    }
}

pub fn default_transport_registry() -> TransportRegistry {
    let mut registry = TransportRegistry::new();
    registry.register(DryrunTransport);
    registry.register(DifyTransport::from_env());
    registry
}

/// HTTP client for the viewer bridge endpoints: current frame, current links
/// and the control slot. A 404 from the bridge is the absent-data state.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    base_url: String,
    http: HttpClient,
}

impl BridgeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(non_empty_env("WAYFARER_BRIDGE_URL").unwrap_or_else(|| {
            DEFAULT_BRIDGE_URL.to_string()
        }))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl ImageSupplier for BridgeClient {
    fn current_image(&self) -> Result<Option<ImageBytes>> {
        let endpoint = self.endpoint(BRIDGE_IMAGE_PATH);
        let response = self
            .http
            .get(&endpoint)
            .send()
            .with_context(|| format!("bridge image request failed ({endpoint})"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "bridge image request failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading bridge image bytes")?
            .to_vec();
        // Some bridges return the stored data URL verbatim instead of the
        // decoded frame.
        if bytes.starts_with(b"data:image/") {
            let url = String::from_utf8(bytes).context("data URL body is not UTF-8")?;
            return Ok(Some(ImageBytes::from_data_url(&url)?));
        }
        Ok(Some(ImageBytes { bytes, mime_type }))
    }
}

impl LinkSupplier for BridgeClient {
    fn current_directions(&self) -> Result<Vec<Direction>> {
        let endpoint = self.endpoint(BRIDGE_LINKS_PATH);
        let response = self
            .http
            .get(&endpoint)
            .send()
            .with_context(|| format!("bridge links request failed ({endpoint})"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let payload = response_json_or_error("bridge links", response)?;
        let links = payload.get("links").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(links).context("bridge links payload has unexpected shape")
    }
}

impl CommandSink for BridgeClient {
    fn send_navigation(&self, pano_id: &str, heading: f64) -> Result<()> {
        let endpoint = self.endpoint(BRIDGE_CONTROL_PATH);
        let response = self
            .http
            .post(&endpoint)
            .json(&json!({
                "action": "moveToLocation",
                "panoId": pano_id,
                "heading": heading,
            }))
            .send()
            .with_context(|| format!("bridge control request failed ({endpoint})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "bridge rejected navigation command ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        Ok(())
    }
}

/// In-process bridge over a shared [`BridgeState`]: the viewer half publishes
/// frames and links and polls for commands, the guide half reads them through
/// the collaborator traits. Replaces the cross-process polling endpoints when
/// both halves live in one process.
#[derive(Clone, Default)]
pub struct LocalBridge {
    state: Arc<Mutex<BridgeState>>,
}

impl LocalBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BridgeState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("bridge state lock poisoned"))
    }

    pub fn publish_image(&self, image: ImageBytes) -> Result<()> {
        let mime = image
            .mime_type
            .clone()
            .unwrap_or_else(|| "image/jpeg".to_string());
        self.lock()?.publish_image(image.bytes, mime);
        Ok(())
    }

    pub fn publish_links(&self, links: Vec<Direction>) -> Result<()> {
        self.lock()?.publish_links(links);
        Ok(())
    }

    /// Viewer-side poll; clears the slot like the HTTP control endpoint does.
    pub fn take_command(&self) -> Result<Option<PendingCommand>> {
        Ok(self.lock()?.take_command())
    }
}

impl ImageSupplier for LocalBridge {
    fn current_image(&self) -> Result<Option<ImageBytes>> {
        Ok(self.lock()?.current_image().map(|stored| ImageBytes {
            bytes: stored.bytes,
            mime_type: Some(stored.mime_type),
        }))
    }
}

impl LinkSupplier for LocalBridge {
    fn current_directions(&self) -> Result<Vec<Direction>> {
        Ok(self.lock()?.current_links().unwrap_or_default())
    }
}

impl CommandSink for LocalBridge {
    fn send_navigation(&self, pano_id: &str, heading: f64) -> Result<()> {
        self.lock()?.push_command(pano_id, heading);
        Ok(())
    }
}

/// Dify-style chat backend: multipart file upload plus a streaming
/// `chat-messages` call whose raw body is handed back for extraction.
pub struct DifyTransport {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl DifyTransport {
    pub fn from_env() -> Self {
        Self::with_config(
            non_empty_env("DIFY_API_BASE").unwrap_or_else(|| DEFAULT_CHAT_API_BASE.to_string()),
            non_empty_env("DIFY_API_KEY"),
        )
    }

    pub fn with_config(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            http: HttpClient::new(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow!("DIFY_API_KEY not set"))
    }
}

impl ChatTransport for DifyTransport {
    fn name(&self) -> &str {
        "dify"
    }

    fn upload_image(&self, image: &ImageBytes, user: &str) -> Result<String> {
        let api_key = self.require_api_key()?;
        let file_name = format!("streetview_{}.{}", timestamp_millis(), image.extension());
        let mut part = MultipartPart::bytes(image.bytes.clone()).file_name(file_name.clone());
        if let Some(mime) = image.mime_type.as_deref() {
            part = part
                .mime_str(mime)
                .with_context(|| format!("invalid mime '{mime}' for {file_name}"))?;
        }
        let form = MultipartForm::new()
            .part("file", part)
            .text("user", user.to_string());

        let endpoint = format!("{}/files/upload", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .with_context(|| format!("chat file upload failed ({endpoint})"))?;
        let payload = response_json_or_error("chat file upload", response)?;
        payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("upload response carried no file id"))
    }

    fn send_query(&self, request: &ChatRequest) -> Result<String> {
        let api_key = self.require_api_key()?;
        let mut body = json!({
            "inputs": {},
            "query": request.query,
            "response_mode": "streaming",
            "user": request.user,
        });
        if let Some(file_id) = request.upload_file_id.as_deref() {
            body["files"] = json!([{
                "type": "image",
                "transfer_method": "local_file",
                "upload_file_id": file_id,
            }]);
        }

        let endpoint = format!("{}/chat-messages", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .with_context(|| format!("chat request failed ({endpoint})"))?;
        let status = response.status();
        let text = response.text().context("chat response body read failed")?;
        if !status.is_success() {
            bail!(
                "chat request failed ({}): {}",
                status.as_u16(),
                truncate_text(&text, 512)
            );
        }
        Ok(text)
    }
}

/// Offline transport that fabricates a plausible streamed reply: it navigates
/// to the first option listed in the enriched query, or answers with
/// commentary only when the query carries no options.
pub struct DryrunTransport;

impl DryrunTransport {
    fn first_option(query: &str) -> Option<(String, f64)> {
        let after_id = query.split_once("(id: ")?.1;
        let (pano_id, rest) = after_id.split_once(',')?;
        let heading = rest
            .split_once("heading: ")
            .and_then(|(_, tail)| tail.split('°').next())
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .unwrap_or(0.0);
        let pano_id = pano_id.trim();
        if pano_id.is_empty() {
            return None;
        }
        Some((pano_id.to_string(), heading))
    }
}

impl ChatTransport for DryrunTransport {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn upload_image(&self, image: &ImageBytes, _user: &str) -> Result<String> {
        Ok(format!("dryrun-{}", &image.sha256_hex()[..12]))
    }

    fn send_query(&self, request: &ChatRequest) -> Result<String> {
        let answer = match Self::first_option(&request.query) {
            Some((pano_id, heading)) => json!({
                "panoId": pano_id,
                "heading": heading,
                "commentary": "Taking the nearest unexplored direction.",
            })
            .to_string(),
            None => json!({
                "commentary": "Nowhere new to go from here; enjoy the view.",
            })
            .to_string(),
        };
        let envelope = json!({
            "event": "workflow_finished",
            "data": {"outputs": {"answer": format!("```json\n{answer}\n```")}},
        });
        Ok(format!(
            "data: {}\n\ndata: {}\n\n",
            json!({"event": "workflow_started", "data": {}}),
            envelope
        ))
    }
}

/// Image supplier for offline runs: a flat-color JPEG whose color is derived
/// from the label hash, encoded in memory.
pub struct PlaceholderImageSupplier {
    width: u32,
    height: u32,
    label: String,
}

impl PlaceholderImageSupplier {
    pub fn new(width: u32, height: u32, label: impl Into<String>) -> Self {
        Self {
            width,
            height,
            label: label.into(),
        }
    }
}

impl ImageSupplier for PlaceholderImageSupplier {
    fn current_image(&self) -> Result<Option<ImageBytes>> {
        let mut hasher = Sha256::new();
        hasher.update(self.label.as_bytes());
        let digest = hasher.finalize();
        let pixel = Rgb([digest[0], digest[1], digest[2]]);

        let mut frame = RgbImage::new(self.width.max(1), self.height.max(1));
        for target in frame.pixels_mut() {
            *target = pixel;
        }
        let mut bytes = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 85);
        encoder
            .encode_image(&DynamicImage::ImageRgb8(frame))
            .context("failed encoding placeholder frame")?;
        Ok(Some(ImageBytes {
            bytes,
            mime_type: Some("image/jpeg".to_string()),
        }))
    }
}

pub fn probe_dimensions(image: &ImageBytes) -> Option<(u32, u32)> {
    let decoded = image::load_from_memory(&image.bytes).ok()?;
    Some((decoded.width(), decoded.height()))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuideReply {
    pub commentary: Option<String>,
    pub navigated_to: Option<String>,
    pub heading: Option<f64>,
    /// Final answer text surfaced when it carried no parseable decision,
    /// instead of being discarded.
    pub raw_answer: Option<String>,
    pub warnings: Vec<String>,
}

/// One tour session: composes the suppliers, the chat transport and the
/// command sink around the pure ranking and extraction core. Keeps the
/// visited history, the current heading and the upload dedupe cache.
pub struct GuideSession {
    session_id: String,
    events: EventWriter,
    transport: Box<dyn ChatTransport>,
    images: Box<dyn ImageSupplier>,
    links: Box<dyn LinkSupplier>,
    commands: Box<dyn CommandSink>,
    visited: VisitedSet,
    upload_cache: BTreeMap<String, String>,
    user: String,
    current_heading: f64,
}

impl GuideSession {
    pub fn new(
        events_path: impl Into<PathBuf>,
        transport: Box<dyn ChatTransport>,
        images: Box<dyn ImageSupplier>,
        links: Box<dyn LinkSupplier>,
        commands: Box<dyn CommandSink>,
        user: Option<String>,
        start_heading: f64,
    ) -> Result<Self> {
        let session_id = new_session_id();
        let events = EventWriter::new(events_path.into(), session_id.clone());
        events.emit(
            "session_started",
            map_object(json!({
                "transport": transport.name(),
                "user": user.as_deref().unwrap_or(DEFAULT_USER),
                "start_heading": start_heading,
            })),
        )?;
        Ok(Self {
            session_id,
            events,
            transport,
            images,
            links,
            commands,
            visited: VisitedSet::new(),
            upload_cache: BTreeMap::new(),
            user: user.unwrap_or_else(|| DEFAULT_USER.to_string()),
            current_heading: normalize_heading(start_heading),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn current_heading(&self) -> f64 {
        self.current_heading
    }

    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    /// Clears the visited history, keeping only the given current viewpoint.
    pub fn reset(&mut self, current_pano: &str) -> Result<()> {
        self.visited.reset(current_pano);
        self.events.emit(
            "history_reset",
            map_object(json!({"current_pano": current_pano})),
        )?;
        Ok(())
    }

    /// Ranked unvisited candidates at the current viewpoint.
    pub fn candidates(&self) -> Result<Vec<Direction>> {
        let directions = self.links.current_directions()?;
        Ok(rank_directions(
            &directions,
            self.current_heading,
            &self.visited,
        ))
    }

    pub fn ask(&mut self, query: &str) -> Result<GuideReply> {
        let mut warnings = Vec::new();

        let (image, directions) = self.gather_context(&mut warnings)?;
        let ranked = rank_directions(&directions, self.current_heading, &self.visited);
        self.events.emit(
            "links_ranked",
            map_object(json!({
                "total": directions.len(),
                "unvisited": ranked.len(),
            })),
        )?;
        if ranked.is_empty() && !directions.is_empty() {
            // Every neighbor has been visited; still worth telling the model.
            self.events.emit("fully_explored", EventPayload::new())?;
        }

        let final_query = if ranked.is_empty() {
            query.to_string()
        } else {
            format!(
                "{query}\n\nAvailable navigation options:\n{}",
                format_options(&ranked)
            )
        };

        let upload_file_id = match image {
            Some(image) => self.resolve_upload(&image, &mut warnings)?,
            None => None,
        };

        let request = ChatRequest {
            query: final_query,
            user: self.user.clone(),
            upload_file_id,
        };
        self.events.emit(
            "chat_request",
            map_object(json!({
                "transport": self.transport.name(),
                "query_chars": request.query.len(),
                "has_image": request.upload_file_id.is_some(),
            })),
        )?;
        let payload = self.transport.send_query(&request)?;

        let answer = extract_final_answer(&payload);
        let decision = answer.as_deref().and_then(decision_from_answer);
        let reply = match decision {
            Some(Extraction::Navigate(decision)) => {
                match self
                    .commands
                    .send_navigation(&decision.pano_id, decision.heading)
                {
                    Ok(()) => {
                        self.events.emit(
                            "navigation_dispatched",
                            map_object(json!({
                                "panoId": decision.pano_id,
                                "heading": decision.heading,
                            })),
                        )?;
                    }
                    Err(err) => {
                        let warning = format!("navigation dispatch failed: {err:#}");
                        self.events.emit(
                            "navigation_dispatch_failed",
                            map_object(json!({"error": warning.clone()})),
                        )?;
                        warnings.push(warning);
                    }
                }
                self.visited.mark(decision.pano_id.clone());
                self.current_heading = normalize_heading(decision.heading);
                GuideReply {
                    commentary: Some(decision.commentary),
                    navigated_to: Some(decision.pano_id),
                    heading: Some(decision.heading),
                    raw_answer: None,
                    warnings,
                }
            }
            Some(Extraction::Commentary(text)) => GuideReply {
                commentary: Some(text),
                warnings,
                ..GuideReply::default()
            },
            None => match answer {
                Some(raw) => {
                    self.events.emit(
                        "answer_unparsed",
                        map_object(json!({"answer_chars": raw.len()})),
                    )?;
                    GuideReply {
                        raw_answer: Some(raw),
                        warnings,
                        ..GuideReply::default()
                    }
                }
                None => {
                    self.events.emit("no_answer", EventPayload::new())?;
                    GuideReply {
                        warnings,
                        ..GuideReply::default()
                    }
                }
            },
        };

        self.events.emit(
            "reply_ready",
            map_object(json!({
                "navigated": reply.navigated_to.is_some(),
                "has_commentary": reply.commentary.is_some(),
                "warnings": reply.warnings.len(),
            })),
        )?;
        Ok(reply)
    }

    /// Fetches the frame and the link list concurrently; either collaborator
    /// failing degrades to absent data with a warning.
    fn gather_context(
        &self,
        warnings: &mut Vec<String>,
    ) -> Result<(Option<ImageBytes>, Vec<Direction>)> {
        let images = self.images.as_ref();
        let links = self.links.as_ref();
        let (image_result, links_result) = thread::scope(|scope| {
            let image_handle = scope.spawn(move || images.current_image());
            let links_handle = scope.spawn(move || links.current_directions());
            (
                image_handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("image supplier panicked"))),
                links_handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("link supplier panicked"))),
            )
        });

        let image = match image_result {
            Ok(image) => image,
            Err(err) => {
                let warning = format!("image fetch failed: {err:#}");
                self.events.emit(
                    "image_fetch_failed",
                    map_object(json!({"error": warning.clone()})),
                )?;
                warnings.push(warning);
                None
            }
        };
        let directions = match links_result {
            Ok(directions) => directions,
            Err(err) => {
                let warning = format!("link fetch failed: {err:#}");
                self.events.emit(
                    "link_fetch_failed",
                    map_object(json!({"error": warning.clone()})),
                )?;
                warnings.push(warning);
                Vec::new()
            }
        };
        Ok((image, directions))
    }

    /// Uploads the frame unless an identical one was already uploaded this
    /// session; upload failure degrades to a text-only request.
    fn resolve_upload(
        &mut self,
        image: &ImageBytes,
        warnings: &mut Vec<String>,
    ) -> Result<Option<String>> {
        let digest = image.sha256_hex();
        if let Some(file_id) = self.upload_cache.get(&digest) {
            self.events.emit(
                "upload_cache_hit",
                map_object(json!({"file_id": file_id.clone()})),
            )?;
            return Ok(Some(file_id.clone()));
        }
        match self.transport.upload_image(image, &self.user) {
            Ok(file_id) => {
                let dims = probe_dimensions(image);
                self.events.emit(
                    "image_uploaded",
                    map_object(json!({
                        "file_id": file_id.clone(),
                        "bytes": image.bytes.len(),
                        "width": dims.map(|(w, _)| w),
                        "height": dims.map(|(_, h)| h),
                    })),
                )?;
                self.upload_cache.insert(digest, file_id.clone());
                Ok(Some(file_id))
            }
            Err(err) => {
                let warning = format!("image upload failed, proceeding without it: {err:#}");
                self.events.emit(
                    "image_upload_failed",
                    map_object(json!({"error": warning.clone()})),
                )?;
                warnings.push(warning);
                Ok(None)
            }
        }
    }
}

fn response_json_or_error(what: &str, response: reqwest::blocking::Response) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{what} response body read failed"))?;
    if !status.is_success() {
        bail!("{what} failed ({code}): {}", truncate_text(&body, 512));
    }
    serde_json::from_str(&body).with_context(|| format!("{what} returned invalid JSON"))
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use wayfarer_contracts::Direction;

    use super::{
        probe_dimensions, ChatRequest, ChatTransport, DryrunTransport, GuideSession, ImageBytes,
        ImageSupplier, LocalBridge, PlaceholderImageSupplier,
    };

    fn direction(pano_id: &str, heading: f64) -> Direction {
        Direction {
            pano_id: pano_id.to_string(),
            heading,
            description: String::new(),
        }
    }

    #[derive(Clone)]
    struct ScriptedTransport {
        answer: String,
        uploads: Arc<Mutex<u32>>,
        queries: Arc<Mutex<Vec<ChatRequest>>>,
    }

    impl ScriptedTransport {
        fn new(answer: &str) -> Self {
            Self {
                answer: answer.to_string(),
                uploads: Arc::new(Mutex::new(0)),
                queries: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn upload_count(&self) -> u32 {
            self.uploads.lock().map(|count| *count).unwrap_or(0)
        }

        fn last_query(&self) -> Option<ChatRequest> {
            self.queries
                .lock()
                .ok()
                .and_then(|queries| queries.last().cloned())
        }
    }

    impl ChatTransport for ScriptedTransport {
        fn name(&self) -> &str {
            "scripted"
        }

        fn upload_image(&self, _image: &ImageBytes, _user: &str) -> anyhow::Result<String> {
            let mut count = self
                .uploads
                .lock()
                .map_err(|_| anyhow::anyhow!("lock poisoned"))?;
            *count += 1;
            Ok(format!("file-{count}"))
        }

        fn send_query(&self, request: &ChatRequest) -> anyhow::Result<String> {
            self.queries
                .lock()
                .map_err(|_| anyhow::anyhow!("lock poisoned"))?
                .push(request.clone());
            let envelope = json!({
                "event": "node_finished",
                "data": {"outputs": {"answer": self.answer}},
            });
            Ok(format!("data: {envelope}\n\n"))
        }
    }

    fn session_with(
        transport: ScriptedTransport,
        bridge: &LocalBridge,
        events_dir: &std::path::Path,
    ) -> anyhow::Result<GuideSession> {
        GuideSession::new(
            events_dir.join("events.jsonl"),
            Box::new(transport),
            Box::new(bridge.clone()),
            Box::new(bridge.clone()),
            Box::new(bridge.clone()),
            None,
            0.0,
        )
    }

    #[test]
    fn ask_dispatches_navigation_and_tracks_history() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let bridge = LocalBridge::new();
        bridge.publish_image(ImageBytes {
            bytes: vec![1, 2, 3, 4],
            mime_type: Some("image/jpeg".to_string()),
        })?;
        bridge.publish_links(vec![
            direction("A", 10.0),
            direction("B", 190.0),
            direction("C", 5.0),
        ])?;

        let answer = "```json\n{\"panoId\":\"C\",\"heading\":5,\"commentary\":\"down the lane\"}\n```";
        let transport = ScriptedTransport::new(answer);
        let mut session = session_with(transport.clone(), &bridge, temp.path())?;

        let reply = session.ask("where should we go?")?;
        assert_eq!(reply.navigated_to.as_deref(), Some("C"));
        assert_eq!(reply.heading, Some(5.0));
        assert_eq!(reply.commentary.as_deref(), Some("down the lane"));
        assert!(reply.warnings.is_empty());

        let command = bridge.take_command()?.ok_or_else(|| anyhow::anyhow!("no command"))?;
        assert_eq!(command.pano_id, "C");
        assert_eq!(command.heading, 5.0);
        assert_eq!(bridge.take_command()?, None);

        assert_eq!(session.visited_count(), 1);
        assert_eq!(session.current_heading(), 5.0);

        // The forwarded query carries the ranked options, nearest first.
        let request = transport
            .last_query()
            .ok_or_else(|| anyhow::anyhow!("no query recorded"))?;
        assert!(request.query.contains("Available navigation options:"));
        let c_at = request.query.find("id: C").unwrap_or(usize::MAX);
        let a_at = request.query.find("id: A").unwrap_or(usize::MAX);
        let b_at = request.query.find("id: B").unwrap_or(usize::MAX);
        assert!(c_at < a_at && a_at < b_at);
        assert_eq!(request.upload_file_id.as_deref(), Some("file-1"));
        Ok(())
    }

    #[test]
    fn unchanged_image_is_uploaded_once() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let bridge = LocalBridge::new();
        bridge.publish_image(ImageBytes {
            bytes: vec![7; 64],
            mime_type: Some("image/jpeg".to_string()),
        })?;
        bridge.publish_links(vec![direction("A", 10.0), direction("B", 90.0)])?;

        let transport = ScriptedTransport::new(
            "{\"panoId\":\"A\",\"heading\":10,\"commentary\":\"onward\"}",
        );
        let mut session = session_with(transport.clone(), &bridge, temp.path())?;

        session.ask("first")?;
        session.ask("second")?;
        assert_eq!(transport.upload_count(), 1);
        Ok(())
    }

    #[test]
    fn commentary_only_reply_sends_no_command() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let bridge = LocalBridge::new();
        bridge.publish_links(vec![direction("A", 10.0)])?;

        let transport = ScriptedTransport::new("{\"commentary\":\"nice view\"}");
        let mut session = session_with(transport, &bridge, temp.path())?;

        let reply = session.ask("what do you see?")?;
        assert_eq!(reply.commentary.as_deref(), Some("nice view"));
        assert_eq!(reply.navigated_to, None);
        assert_eq!(bridge.take_command()?, None);
        assert_eq!(session.visited_count(), 0);
        Ok(())
    }

    #[test]
    fn unparsed_answer_is_surfaced_not_discarded() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let bridge = LocalBridge::new();

        let transport = ScriptedTransport::new("just chatting, no decision here");
        let mut session = session_with(transport, &bridge, temp.path())?;

        let reply = session.ask("hello")?;
        assert_eq!(
            reply.raw_answer.as_deref(),
            Some("just chatting, no decision here")
        );
        assert_eq!(reply.commentary, None);
        assert_eq!(reply.navigated_to, None);
        Ok(())
    }

    #[test]
    fn dryrun_transport_navigates_to_first_listed_option() -> anyhow::Result<()> {
        let request = ChatRequest {
            query: "go\n\nAvailable navigation options:\n1. direction (id: C, heading: 5°)\n2. direction (id: A, heading: 10°)".to_string(),
            user: "test".to_string(),
            upload_file_id: None,
        };
        let payload = DryrunTransport.send_query(&request)?;
        let decision = wayfarer_contracts::decision::extract_decision(&payload);
        match decision {
            Some(wayfarer_contracts::Extraction::Navigate(decision)) => {
                assert_eq!(decision.pano_id, "C");
                assert_eq!(decision.heading, 5.0);
            }
            other => panic!("expected navigation, got {other:?}"),
        }

        let bare = ChatRequest {
            query: "go".to_string(),
            user: "test".to_string(),
            upload_file_id: None,
        };
        let payload = DryrunTransport.send_query(&bare)?;
        assert!(matches!(
            wayfarer_contracts::decision::extract_decision(&payload),
            Some(wayfarer_contracts::Extraction::Commentary(_))
        ));
        Ok(())
    }

    #[test]
    fn placeholder_supplier_encodes_a_decodable_jpeg() -> anyhow::Result<()> {
        let supplier = PlaceholderImageSupplier::new(80, 60, "test-pano");
        let image = supplier
            .current_image()?
            .ok_or_else(|| anyhow::anyhow!("no image"))?;
        assert_eq!(image.mime_type.as_deref(), Some("image/jpeg"));
        assert_eq!(probe_dimensions(&image), Some((80, 60)));
        Ok(())
    }

    #[test]
    fn data_url_round_trip() -> anyhow::Result<()> {
        let image = ImageBytes {
            bytes: vec![0, 159, 146, 150],
            mime_type: Some("image/png".to_string()),
        };
        let url = image.to_data_url();
        assert!(url.starts_with("data:image/png;base64,"));
        assert_eq!(ImageBytes::from_data_url(&url)?, image);

        assert!(ImageBytes::from_data_url("https://example.com/x.png").is_err());
        assert!(ImageBytes::from_data_url("data:text/plain;base64,aGk=").is_err());
        Ok(())
    }
}
