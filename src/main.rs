use eframe::egui;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::time::Duration;
use thiserror::Error;

// ── Tuning ──────────────────────────────────────────────────────────────────

/// Outline width for drawn boxes, in surface pixels.
const STROKE_WIDTH: f32 = 2.0;
const BOX_COLOR: egui::Color32 = egui::Color32::RED;

/// How often the readiness poll re-checks the image layout.
const READY_POLL_INTERVAL_MS: u64 = 10;
/// Poll attempts before giving up on an image that never reports a size.
const READY_POLL_LIMIT: u32 = 200;
/// Window resizes are adopted only after the size has been stable this long.
const RESIZE_DEBOUNCE_SECS: f64 = 0.1;
/// How long the treatment input flashes after a blocked drag.
const LABEL_FLASH_SECS: f64 = 0.8;

/// Smallest committed box side, in canonical pixels.
const MIN_BOX_SIDE: f64 = 1.0;

// ── Wire Messages ───────────────────────────────────────────────────────────

/// Messages the host sends into the annotation core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostMessage {
    ImageLoaded {
        filename: String,
        width: u32,
        height: u32,
    },
    ClearClientState,
}

/// Messages the annotation core sends back to the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    BboxCoords {
        filename: String,
        boxes: Vec<BoundingBox>,
    },
}

// ── Data Model ──────────────────────────────────────────────────────────────

/// One annotated square region in canonical image coordinates.
///
/// `x1 < x2` and `y1 < y2` always hold for stored boxes; the sides are equal
/// unless the square had to saturate against an image axis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct BoundingBox {
    x1: u32,
    y1: u32,
    x2: u32,
    y2: u32,
    treatment: String,
}

impl BoundingBox {
    fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            treatment: String::new(),
        }
    }

    /// A box with no usable treatment yet (empty or whitespace only).
    fn is_unlabeled(&self) -> bool {
        self.treatment.trim().is_empty()
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
enum GeometryError {
    /// The drawing surface has no usable size; retry once it is laid out.
    #[error("drawing surface has zero size")]
    DegenerateSurface,
}

/// Convert a surface-pixel position to canonical image coordinates.
fn to_canonical(
    px: f32,
    py: f32,
    surface: (f32, f32),
    canonical: (u32, u32),
) -> Result<(u32, u32), GeometryError> {
    let (sw, sh) = surface;
    if !(sw > 0.0) || !(sh > 0.0) {
        return Err(GeometryError::DegenerateSurface);
    }
    let cx = (px as f64 / sw as f64 * canonical.0 as f64)
        .round()
        .clamp(0.0, canonical.0 as f64);
    let cy = (py as f64 / sh as f64 * canonical.1 as f64)
        .round()
        .clamp(0.0, canonical.1 as f64);
    Ok((cx as u32, cy as u32))
}

/// Convert canonical image coordinates back to surface pixels (unrounded).
fn to_surface(
    cx: u32,
    cy: u32,
    surface: (f32, f32),
    canonical: (u32, u32),
) -> Result<(f32, f32), GeometryError> {
    let (sw, sh) = surface;
    if !(sw > 0.0) || !(sh > 0.0) || canonical.0 == 0 || canonical.1 == 0 {
        return Err(GeometryError::DegenerateSurface);
    }
    Ok((
        (cx as f64 / canonical.0 as f64 * sw as f64) as f32,
        (cy as f64 / canonical.1 as f64 * sh as f64) as f32,
    ))
}

/// Expand a canonical-space rectangle (`x1 <= x2`, `y1 <= y2`) to the
/// smallest enclosing square and fit it to the image bounds.
///
/// The shorter side grows symmetrically. If an edge then falls outside the
/// image, the whole box is translated back in; a side longer than the image
/// axis saturates to the full axis instead. Coordinates stay floating until
/// the final rounding, so the result is exactly square whenever the bounds
/// permit. Applying the function to its own output is a no-op.
fn square_in_bounds(x1: u32, y1: u32, x2: u32, y2: u32, width: u32, height: u32) -> BoundingBox {
    let (mut x1, mut y1, mut x2, mut y2) = (x1 as f64, y1 as f64, x2 as f64, y2 as f64);

    let side = (x2 - x1).max(y2 - y1).max(MIN_BOX_SIDE);
    let gx = (side - (x2 - x1)) / 2.0;
    x1 -= gx;
    x2 += gx;
    let gy = (side - (y2 - y1)) / 2.0;
    y1 -= gy;
    y2 += gy;

    let (x1, x2) = shift_into(x1, x2, width as f64);
    let (y1, y2) = shift_into(y1, y2, height as f64);

    BoundingBox::new(
        x1.round() as u32,
        y1.round() as u32,
        x2.round() as u32,
        y2.round() as u32,
    )
}

/// Translate the span `[lo, hi]` into `[0, bound]`, saturating when it does
/// not fit.
fn shift_into(lo: f64, hi: f64, bound: f64) -> (f64, f64) {
    if hi - lo >= bound {
        (0.0, bound)
    } else if lo < 0.0 {
        (0.0, hi - lo)
    } else if hi > bound {
        (lo - (hi - bound), bound)
    } else {
        (lo, hi)
    }
}

// ── Annotation Store ────────────────────────────────────────────────────────

/// Per-image box sequences, keyed by filename. Insertion order is z-order.
#[derive(Debug, Default)]
struct AnnotationStore {
    boxes_per_image: HashMap<String, Vec<BoundingBox>>,
}

impl AnnotationStore {
    /// Push a box onto an image's sequence, creating the entry if needed.
    fn append(&mut self, filename: &str, bbox: BoundingBox) {
        self.boxes_per_image
            .entry(filename.to_owned())
            .or_default()
            .push(bbox);
    }

    /// Pop the tail box. Returns the removed box, or None if there was
    /// nothing to remove.
    fn remove_last(&mut self, filename: &str) -> Option<BoundingBox> {
        self.boxes_per_image.get_mut(filename)?.pop()
    }

    /// Overwrite the tail box's treatment in place. No-op on an empty or
    /// unknown sequence.
    fn set_last_label(&mut self, filename: &str, text: &str) {
        if let Some(tail) = self
            .boxes_per_image
            .get_mut(filename)
            .and_then(|boxes| boxes.last_mut())
        {
            tail.treatment = text.to_owned();
        }
    }

    fn last(&self, filename: &str) -> Option<&BoundingBox> {
        self.boxes_per_image
            .get(filename)
            .and_then(|boxes| boxes.last())
    }

    fn boxes(&self, filename: &str) -> &[BoundingBox] {
        self.boxes_per_image
            .get(filename)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Drop every image's sequence (host signalled a fresh session).
    fn clear_all(&mut self) {
        self.boxes_per_image.clear();
    }
}

// ── Annotation Session ──────────────────────────────────────────────────────

/// Why a drag-start was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
enum DragRejection {
    #[error("no image loaded")]
    NoActiveImage,
    #[error("surface is not ready")]
    NotReady,
    #[error("last box still needs a treatment label")]
    LabelRequired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("image layout stayed zero-sized after {attempts} polls")]
struct ReadinessTimeout {
    attempts: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum DragPhase {
    Idle,
    Dragging {
        start_x: f32,
        start_y: f32,
        current_x: f32,
        current_y: f32,
    },
    /// Drag-start was refused because the tail box is unlabeled. The rest of
    /// this gesture is discarded.
    BlockedNeedsLabel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Readiness {
    Waiting { polls_left: u32 },
    Ready,
    TimedOut,
}

#[derive(Clone, Debug)]
struct ActiveImage {
    filename: String,
    width: u32,
    height: u32,
}

/// The annotation core: store, view state and the interaction state machine,
/// driven entirely through named entry points so it can be exercised without
/// a UI. Owns the outbound half of the host channel.
struct AnnotationSession {
    store: AnnotationStore,
    active_image: Option<ActiveImage>,
    surface: Option<(f32, f32)>,
    readiness: Readiness,
    phase: DragPhase,
    // one-shot UI requests, consumed by the shell
    label_update: Option<String>,
    label_focus_requested: bool,
    label_flash_requested: bool,
    outbound: Sender<ClientMessage>,
}

impl AnnotationSession {
    fn new(outbound: Sender<ClientMessage>) -> Self {
        Self {
            store: AnnotationStore::default(),
            active_image: None,
            surface: None,
            readiness: Readiness::Waiting {
                polls_left: READY_POLL_LIMIT,
            },
            phase: DragPhase::Idle,
            label_update: None,
            label_focus_requested: false,
            label_flash_requested: false,
            outbound,
        }
    }

    fn handle_host_message(&mut self, msg: HostMessage) {
        match msg {
            HostMessage::ImageLoaded {
                filename,
                width,
                height,
            } => self.image_loaded(filename, width, height),
            HostMessage::ClearClientState => self.clear_session(),
        }
    }

    /// The host switched the displayed image. Interaction stays disabled
    /// until the surface reports a usable size.
    fn image_loaded(&mut self, filename: String, width: u32, height: u32) {
        if width == 0 || height == 0 {
            log::warn!("ignoring image {filename} with zero dimension {width}x{height}");
            return;
        }
        log::info!("image loaded: {filename} ({width}x{height})");
        self.label_update = Some(
            self.store
                .last(&filename)
                .map(|b| b.treatment.clone())
                .unwrap_or_default(),
        );
        self.active_image = Some(ActiveImage {
            filename,
            width,
            height,
        });
        self.surface = None;
        self.phase = DragPhase::Idle;
        self.readiness = Readiness::Waiting {
            polls_left: READY_POLL_LIMIT,
        };
    }

    /// The host started a fresh session; every image's boxes are dropped.
    fn clear_session(&mut self) {
        log::info!("clearing all stored boxes");
        self.store.clear_all();
        self.label_update = Some(String::new());
    }

    /// One readiness poll tick. `laid_out` is the image's currently laid-out
    /// size as reported by the shell, if any.
    fn poll_surface(&mut self, laid_out: Option<(f32, f32)>) -> Result<(), ReadinessTimeout> {
        let Readiness::Waiting { polls_left } = self.readiness else {
            return Ok(());
        };
        if self.active_image.is_none() {
            return Ok(());
        }
        match laid_out {
            Some((w, h)) if w > 0.0 && h > 0.0 => {
                log::debug!("surface ready at {w}x{h}");
                self.surface = Some((w, h));
                self.readiness = Readiness::Ready;
                Ok(())
            }
            _ if polls_left == 0 => {
                self.readiness = Readiness::TimedOut;
                let err = ReadinessTimeout {
                    attempts: READY_POLL_LIMIT,
                };
                log::warn!("{err}");
                Err(err)
            }
            _ => {
                self.readiness = Readiness::Waiting {
                    polls_left: polls_left - 1,
                };
                Ok(())
            }
        }
    }

    /// Adopt a new surface size after a window resize. The image itself did
    /// not change, so readiness is untouched.
    fn surface_resized(&mut self, size: (f32, f32)) {
        if self.readiness == Readiness::Ready && size.0 > 0.0 && size.1 > 0.0 {
            log::debug!("surface resized to {}x{}", size.0, size.1);
            self.surface = Some(size);
        }
    }

    fn pointer_down(&mut self, x: f32, y: f32) -> Result<(), DragRejection> {
        let filename = match &self.active_image {
            Some(img) => img.filename.clone(),
            None => return Err(DragRejection::NoActiveImage),
        };
        if self.readiness != Readiness::Ready {
            return Err(DragRejection::NotReady);
        }
        if self.store.last(&filename).is_some_and(|b| b.is_unlabeled()) {
            self.phase = DragPhase::BlockedNeedsLabel;
            self.label_flash_requested = true;
            self.label_focus_requested = true;
            return Err(DragRejection::LabelRequired);
        }
        let (x, y) = self.clamp_to_surface(x, y);
        self.phase = DragPhase::Dragging {
            start_x: x,
            start_y: y,
            current_x: x,
            current_y: y,
        };
        Ok(())
    }

    fn pointer_moved(&mut self, x: f32, y: f32) {
        if let DragPhase::Dragging {
            start_x, start_y, ..
        } = self.phase
        {
            let (x, y) = self.clamp_to_surface(x, y);
            self.phase = DragPhase::Dragging {
                start_x,
                start_y,
                current_x: x,
                current_y: y,
            };
        }
    }

    /// Commit the drag: canonicalize, square, store, and sync to the host.
    fn pointer_up(&mut self, x: f32, y: f32) {
        match self.phase {
            DragPhase::Dragging {
                start_x, start_y, ..
            } => {
                self.phase = DragPhase::Idle;
                let Some(img) = self.active_image.clone() else {
                    return;
                };
                let Some(surface) = self.surface else {
                    return;
                };
                let (x, y) = self.clamp_to_surface(x, y);
                let canonical = (img.width, img.height);
                let lo = to_canonical(start_x.min(x), start_y.min(y), surface, canonical);
                let hi = to_canonical(start_x.max(x), start_y.max(y), surface, canonical);
                let ((x1, y1), (x2, y2)) = match (lo, hi) {
                    (Ok(lo), Ok(hi)) => (lo, hi),
                    _ => {
                        log::warn!("skipping box commit: {}", GeometryError::DegenerateSurface);
                        return;
                    }
                };
                let bbox = square_in_bounds(x1, y1, x2, y2, img.width, img.height);
                log::debug!(
                    "box committed on {}: ({},{})-({},{})",
                    img.filename,
                    bbox.x1,
                    bbox.y1,
                    bbox.x2,
                    bbox.y2
                );
                self.store.append(&img.filename, bbox);
                self.label_update = Some(String::new());
                self.label_focus_requested = true;
                self.emit_boxes();
            }
            DragPhase::BlockedNeedsLabel => self.phase = DragPhase::Idle,
            DragPhase::Idle => {}
        }
    }

    /// The pointer left the surface mid-gesture: discard the live box.
    fn pointer_left(&mut self) {
        if matches!(self.phase, DragPhase::Dragging { .. }) {
            log::debug!("drag cancelled: pointer left the surface");
        }
        self.phase = DragPhase::Idle;
    }

    /// Remove the tail box of the active image. Undoing with no boxes is a
    /// silent no-op; nothing is emitted either.
    fn undo(&mut self) {
        let Some(img) = self.active_image.clone() else {
            return;
        };
        if self.store.remove_last(&img.filename).is_none() {
            return;
        }
        let tail_label = self
            .store
            .last(&img.filename)
            .map(|b| b.treatment.clone())
            .unwrap_or_default();
        log::debug!(
            "undo on {}: {} box(es) left",
            img.filename,
            self.store.boxes(&img.filename).len()
        );
        self.label_update = Some(tail_label);
        self.emit_boxes();
    }

    /// A keystroke in the treatment input. Chatty on purpose: the host's
    /// copy follows every edit.
    fn label_edited(&mut self, text: &str) {
        let Some(img) = self.active_image.clone() else {
            return;
        };
        if self.store.last(&img.filename).is_none() {
            return;
        }
        self.store.set_last_label(&img.filename, text);
        self.emit_boxes();
    }

    fn emit_boxes(&self) {
        let Some(img) = &self.active_image else {
            return;
        };
        let msg = ClientMessage::BboxCoords {
            filename: img.filename.clone(),
            boxes: self.store.boxes(&img.filename).to_vec(),
        };
        if self.outbound.send(msg).is_err() {
            log::warn!("host channel closed, dropping box update");
        }
    }

    fn clamp_to_surface(&self, x: f32, y: f32) -> (f32, f32) {
        match self.surface {
            Some((w, h)) => (x.clamp(0.0, w), y.clamp(0.0, h)),
            None => (x, y),
        }
    }

    // ── read-only view for the shell ──

    fn ready(&self) -> bool {
        self.readiness == Readiness::Ready
    }

    fn waiting_for_surface(&self) -> bool {
        matches!(self.readiness, Readiness::Waiting { .. })
    }

    fn surface(&self) -> Option<(f32, f32)> {
        self.surface
    }

    fn canonical_size(&self) -> Option<(u32, u32)> {
        self.active_image
            .as_ref()
            .map(|img| (img.width, img.height))
    }

    fn boxes(&self) -> &[BoundingBox] {
        match &self.active_image {
            Some(img) => self.store.boxes(&img.filename),
            None => &[],
        }
    }

    /// Live drag rectangle in surface pixels (min corner, max corner).
    fn live_rect(&self) -> Option<(f32, f32, f32, f32)> {
        if let DragPhase::Dragging {
            start_x,
            start_y,
            current_x,
            current_y,
        } = self.phase
        {
            Some((
                start_x.min(current_x),
                start_y.min(current_y),
                start_x.max(current_x),
                start_y.max(current_y),
            ))
        } else {
            None
        }
    }

    /// The treatment input is editable whenever the active image has boxes.
    fn label_editable(&self) -> bool {
        !self.boxes().is_empty()
    }

    fn take_label_update(&mut self) -> Option<String> {
        self.label_update.take()
    }

    fn take_label_focus_request(&mut self) -> bool {
        std::mem::take(&mut self.label_focus_requested)
    }

    fn take_label_flash_request(&mut self) -> bool {
        std::mem::take(&mut self.label_flash_requested)
    }
}

// ── Overlay Rendering ───────────────────────────────────────────────────────

/// Stroke every stored box of the active image onto the surface, then the
/// live drag rectangle (already in surface pixels) on top. Reads only.
fn draw_overlay(
    painter: &egui::Painter,
    surface_rect: egui::Rect,
    boxes: &[BoundingBox],
    canonical: (u32, u32),
    live: Option<(f32, f32, f32, f32)>,
) {
    let surface = (surface_rect.width(), surface_rect.height());
    let stroke = egui::Stroke::new(STROKE_WIDTH, BOX_COLOR);
    for bbox in boxes {
        let (Ok((x1, y1)), Ok((x2, y2))) = (
            to_surface(bbox.x1, bbox.y1, surface, canonical),
            to_surface(bbox.x2, bbox.y2, surface, canonical),
        ) else {
            // zero-sized surface; the next render after layout will catch up
            return;
        };
        painter.rect_stroke(
            egui::Rect::from_min_max(
                surface_rect.min + egui::vec2(x1, y1),
                surface_rect.min + egui::vec2(x2, y2),
            ),
            0.0,
            stroke,
            egui::StrokeKind::Middle,
        );
    }
    if let Some((x1, y1, x2, y2)) = live {
        painter.rect_stroke(
            egui::Rect::from_min_max(
                surface_rect.min + egui::vec2(x1, y1),
                surface_rect.min + egui::vec2(x2, y2),
            ),
            0.0,
            stroke,
            egui::StrokeKind::Middle,
        );
    }
}

/// Where the image lands inside the panel: scaled to fit, centered.
fn fitted_image_rect(avail: egui::Rect, canonical: (u32, u32)) -> egui::Rect {
    let (w, h) = (canonical.0 as f32, canonical.1 as f32);
    if w <= 0.0 || h <= 0.0 {
        return egui::Rect::from_center_size(avail.center(), egui::Vec2::ZERO);
    }
    let scale = (avail.width() / w).min(avail.height() / h);
    egui::Rect::from_center_size(avail.center(), egui::vec2(w * scale, h * scale))
}

// ── App ─────────────────────────────────────────────────────────────────────

struct AnnotateApp {
    session: AnnotationSession,
    // host side of the channel: the shell plays host for the core
    host_tx: Sender<HostMessage>,
    host_rx: Receiver<HostMessage>,
    client_rx: Receiver<ClientMessage>,

    batch: Vec<PathBuf>,
    current: Option<usize>,
    textures: HashMap<String, egui::TextureHandle>,
    undecodable: HashSet<String>,

    label_buf: String,
    label_flash_until: Option<f64>,
    pending_resize: Option<(f64, (f32, f32))>,
    sync_status: Option<String>,
}

impl AnnotateApp {
    fn new(batch: Vec<PathBuf>) -> Self {
        let (host_tx, host_rx) = std::sync::mpsc::channel();
        let (client_tx, client_rx) = std::sync::mpsc::channel();
        let mut app = Self {
            session: AnnotationSession::new(client_tx),
            host_tx,
            host_rx,
            client_rx,
            batch,
            current: None,
            textures: HashMap::new(),
            undecodable: HashSet::new(),
            label_buf: String::new(),
            label_flash_until: None,
            pending_resize: None,
            sync_status: None,
        };
        if !app.batch.is_empty() {
            app.select_image(0);
        }
        app
    }

    /// Announce an image switch the way the host would: read its canonical
    /// dimensions and send `image_loaded` through the channel.
    fn select_image(&mut self, index: usize) {
        let Some(path) = self.batch.get(index) else {
            return;
        };
        match image::image_dimensions(path) {
            Ok((width, height)) => {
                self.current = Some(index);
                self.sync_status = None;
                self.pending_resize = None;
                let _ = self.host_tx.send(HostMessage::ImageLoaded {
                    filename: filename_key(path),
                    width,
                    height,
                });
            }
            Err(err) => log::error!("cannot read {}: {err}", path.display()),
        }
    }

    /// A fresh batch picked in the file dialog replaces the session, like a
    /// new upload on the host side.
    fn open_files(&mut self) {
        let picked = rfd::FileDialog::new()
            .add_filter("images", &["png", "jpg", "jpeg", "tif", "tiff", "bmp", "gif"])
            .pick_files();
        let Some(paths) = picked else {
            return;
        };
        if paths.is_empty() {
            return;
        }
        let _ = self.host_tx.send(HostMessage::ClearClientState);
        self.batch = paths;
        self.current = None;
        self.textures.clear();
        self.undecodable.clear();
        self.select_image(0);
    }

    fn ensure_texture(&mut self, ctx: &egui::Context, path: &Path, filename: &str) {
        if self.textures.contains_key(filename) || self.undecodable.contains(filename) {
            return;
        }
        match image::open(path) {
            Ok(img) => {
                let rgba = img.to_rgba8();
                let size = [rgba.width() as usize, rgba.height() as usize];
                let pixels = rgba.as_flat_samples();
                let color_image = egui::ColorImage::from_rgba_unmultiplied(size, pixels.as_slice());
                let texture = ctx.load_texture(
                    filename.to_owned(),
                    color_image,
                    egui::TextureOptions::LINEAR,
                );
                self.textures.insert(filename.to_owned(), texture);
            }
            Err(err) => {
                log::warn!("cannot decode {}: {err}", path.display());
                self.undecodable.insert(filename.to_owned());
            }
        }
    }

    fn toolbar(&mut self, ctx: &egui::Context, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            if ui.button("Open…").clicked() {
                self.open_files();
            }
            let (has_prev, has_next) = match self.current {
                Some(i) => (i > 0, i + 1 < self.batch.len()),
                None => (false, false),
            };
            if ui
                .add_enabled(has_prev, egui::Button::new("◀ Prev"))
                .clicked()
            {
                if let Some(i) = self.current {
                    self.select_image(i - 1);
                }
            }
            if ui
                .add_enabled(has_next, egui::Button::new("Next ▶"))
                .clicked()
            {
                if let Some(i) = self.current {
                    self.select_image(i + 1);
                }
            }
            ui.separator();
            if ui.button("Undo box").clicked() {
                self.session.undo();
            }
            ui.separator();

            ui.label("Treatment:");
            if let Some(text) = self.session.take_label_update() {
                self.label_buf = text;
            }
            let editable = self.session.label_editable();
            let response = ui.add_enabled(
                editable,
                egui::TextEdit::singleline(&mut self.label_buf)
                    .hint_text("label for the last box")
                    .desired_width(220.0),
            );
            if response.changed() {
                self.session.label_edited(&self.label_buf);
            }
            if self.session.take_label_focus_request() {
                response.request_focus();
            }
            let now = ctx.input(|i| i.time);
            if self.session.take_label_flash_request() {
                self.label_flash_until = Some(now + LABEL_FLASH_SECS);
            }
            if let Some(until) = self.label_flash_until {
                if now < until {
                    ui.painter().rect_stroke(
                        response.rect.expand(2.0),
                        2.0,
                        egui::Stroke::new(2.0, BOX_COLOR),
                        egui::StrokeKind::Middle,
                    );
                    ctx.request_repaint();
                } else {
                    self.label_flash_until = None;
                }
            }
            ui.separator();
            ui.label(self.status_line());
        });
    }

    fn status_line(&self) -> String {
        if let Some(status) = &self.sync_status {
            return status.clone();
        }
        match self.current.and_then(|i| self.batch.get(i)) {
            Some(path) => {
                let name = filename_key(path);
                if self.session.waiting_for_surface() {
                    format!("{name} — preparing surface…")
                } else {
                    format!("{name} — {} box(es)", self.session.boxes().len())
                }
            }
            None => "no image — use Open…".to_owned(),
        }
    }

    fn handle_pointer(
        &mut self,
        ctx: &egui::Context,
        response: &egui::Response,
        surface_rect: egui::Rect,
    ) {
        let local = |pos: egui::Pos2| (pos.x - surface_rect.min.x, pos.y - surface_rect.min.y);

        if response.drag_started_by(egui::PointerButton::Primary) {
            if let Some(pos) = response.hover_pos() {
                if surface_rect.contains(pos) {
                    let (x, y) = local(pos);
                    if let Err(rejection) = self.session.pointer_down(x, y) {
                        log::debug!("drag rejected: {rejection}");
                    }
                }
            }
        }

        if response.dragged_by(egui::PointerButton::Primary) {
            if let Some(pos) = response
                .hover_pos()
                .or(ctx.input(|i| i.pointer.latest_pos()))
            {
                let (x, y) = local(pos);
                self.session.pointer_moved(x, y);
            }
        }

        if response.drag_stopped_by(egui::PointerButton::Primary) {
            match response
                .hover_pos()
                .or(ctx.input(|i| i.pointer.latest_pos()))
            {
                Some(pos) => {
                    let (x, y) = local(pos);
                    self.session.pointer_up(x, y);
                }
                None => self.session.pointer_left(),
            }
        }

        // the pointer leaving the window aborts an in-flight gesture
        if ctx.input(|i| i.pointer.latest_pos().is_none()) {
            self.session.pointer_left();
        }
    }

    /// Central panel: background, image, overlay, pointer routing. Returns
    /// the laid-out surface size once the image is actually displayable.
    fn canvas(&mut self, ctx: &egui::Context, ui: &mut egui::Ui) -> Option<(f32, f32)> {
        let (response, painter) =
            ui.allocate_painter(ui.available_size(), egui::Sense::click_and_drag());
        let canvas_rect = response.rect;
        painter.rect_filled(canvas_rect, 0.0, egui::Color32::from_gray(40));

        let Some(path) = self.current.and_then(|i| self.batch.get(i)).cloned() else {
            painter.text(
                canvas_rect.center(),
                egui::Align2::CENTER_CENTER,
                "Open images to annotate",
                egui::FontId::proportional(16.0),
                egui::Color32::GRAY,
            );
            return None;
        };
        let Some(canonical) = self.session.canonical_size() else {
            return None;
        };
        let filename = filename_key(&path);
        self.ensure_texture(ctx, &path, &filename);

        let surface_rect = fitted_image_rect(canvas_rect, canonical);
        let displayable = match self.textures.get(&filename) {
            Some(texture) => {
                painter.image(
                    texture.id(),
                    surface_rect,
                    egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
                    egui::Color32::WHITE,
                );
                true
            }
            None => false,
        };

        draw_overlay(
            &painter,
            surface_rect,
            self.session.boxes(),
            canonical,
            self.session.live_rect(),
        );

        self.handle_pointer(ctx, &response, surface_rect);

        // crosshair only once interaction is live
        if self.session.ready()
            && response
                .hover_pos()
                .is_some_and(|pos| surface_rect.contains(pos))
        {
            ctx.output_mut(|o| o.cursor_icon = egui::CursorIcon::Crosshair);
        }

        if displayable && surface_rect.width() > 0.0 && surface_rect.height() > 0.0 {
            Some((surface_rect.width(), surface_rect.height()))
        } else {
            None
        }
    }

    /// Keep the session's surface in step with the layout: readiness polls
    /// while an image is loading, debounced adoption on window resizes.
    fn sync_surface(&mut self, ctx: &egui::Context, laid_out: Option<(f32, f32)>) {
        if self.session.waiting_for_surface() {
            if let Err(err) = self.session.poll_surface(laid_out) {
                self.sync_status = Some(err.to_string());
            }
            ctx.request_repaint_after(Duration::from_millis(READY_POLL_INTERVAL_MS));
            return;
        }
        if !self.session.ready() {
            // timed out; only a fresh image_loaded restarts the poll
            return;
        }
        let Some(size) = laid_out else {
            return;
        };
        if self.session.surface() == Some(size) {
            self.pending_resize = None;
            return;
        }
        let now = ctx.input(|i| i.time);
        match self.pending_resize {
            Some((since, pending)) if pending == size => {
                if now - since >= RESIZE_DEBOUNCE_SECS {
                    self.session.surface_resized(size);
                    self.pending_resize = None;
                } else {
                    ctx.request_repaint_after(Duration::from_millis(
                        (RESIZE_DEBOUNCE_SECS * 1000.0) as u64,
                    ));
                }
            }
            _ => {
                self.pending_resize = Some((now, size));
                ctx.request_repaint_after(Duration::from_millis(
                    (RESIZE_DEBOUNCE_SECS * 1000.0) as u64,
                ));
            }
        }
    }
}

impl eframe::App for AnnotateApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // inbound host messages first, so this frame sees the new state
        let inbound: Vec<HostMessage> = self.host_rx.try_iter().collect();
        for msg in inbound {
            self.session.handle_host_message(msg);
        }

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            self.toolbar(ctx, ui);
        });

        let laid_out = egui::CentralPanel::default()
            .show(ctx, |ui| self.canvas(ctx, ui))
            .inner;

        self.sync_surface(ctx, laid_out);

        // relay the core's sync messages to the host end (stdout)
        for msg in self.client_rx.try_iter() {
            match serde_json::to_string(&msg) {
                Ok(line) => println!("{line}"),
                Err(err) => log::error!("cannot serialize outbound message: {err}"),
            }
        }
    }
}

fn filename_key(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned()
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    env_logger::init();

    let batch: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    for path in &batch {
        if !path.exists() {
            eprintln!("File not found: {}", path.display());
            std::process::exit(1);
        }
    }
    if batch.is_empty() {
        log::info!("no images on the command line; use Open… in the toolbar");
    }

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1200.0, 800.0])
            .with_title("annotate-bbox"),
        ..Default::default()
    };

    eframe::run_native(
        "annotate-bbox",
        options,
        Box::new(move |_cc| Ok(Box::new(AnnotateApp::new(batch)))),
    )
    .expect("Failed to run eframe");
}

// ── Tests ───────────────────────────────────────────────────────────────────
