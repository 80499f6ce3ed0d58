use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

pub type DocumentId = String;

/// One known document, as reported by the store's list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub doc_id: DocumentId,
    pub name: String,
    pub pages: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<f64>,
}

/// Axis-aligned highlight box in page-relative coordinates, origin top-left,
/// every coordinate in `[0, 1]`. Serialized on the wire as `[x0, y0, x1, y1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct NormalizedRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl NormalizedRect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn clamp(self) -> Self {
        Self {
            left: self.left.clamp(0.0, 1.0),
            top: self.top.clamp(0.0, 1.0),
            right: self.right.clamp(0.0, 1.0),
            bottom: self.bottom.clamp(0.0, 1.0),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.left <= self.right && self.top <= self.bottom
    }
}

impl From<[f32; 4]> for NormalizedRect {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<NormalizedRect> for [f32; 4] {
    fn from(r: NormalizedRect) -> Self {
        [r.left, r.top, r.right, r.bottom]
    }
}

/// One hit on one page: a group of rectangles plus the label the search
/// engine attached to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHighlight {
    pub page: usize,
    pub rects: Vec<NormalizedRect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// Per-document search outcome; at most one per doc_id per query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub doc_id: DocumentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_name: Option<String>,
    pub total_hits: usize,
    pub highlights: Vec<SearchHighlight>,
}

/// One entry of the flat, globally ordered navigation sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOrderItem {
    pub doc_id: DocumentId,
    pub doc_name: String,
    pub page: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_idx: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryIntent {
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub month: Option<u32>,
    #[serde(default)]
    pub cross_docs: bool,
    #[serde(default)]
    pub raw: String,
}

/// Full response of the search engine for one question.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub intent: QueryIntent,
    #[serde(default)]
    pub results: Vec<SearchResult>,
    #[serde(default)]
    pub order: Vec<MatchOrderItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PageDimensions {
    pub width: f32,
    pub height: f32,
}

/// Page-count manifest served by the store for the raster fallback.
#[derive(Debug, Clone, Deserialize)]
pub struct PageManifest {
    pub count: usize,
    pub pages: Vec<PageDimensions>,
}

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Vector,
    Raster,
}

/// Page surface produced by the vector backend: sized up front from the page
/// viewport, pixels arrive when the (possibly slow) render completes.
pub struct VectorSurface {
    width: u32,
    height: u32,
    rendered: Mutex<Option<RenderImage>>,
}

impl VectorSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            rendered: Mutex::new(None),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn complete_render(&self, image: RenderImage) {
        *self.rendered.lock() = Some(image);
    }

    pub fn is_rendered(&self) -> bool {
        self.rendered.lock().is_some()
    }

    pub fn rendered(&self) -> Option<RenderImage> {
        self.rendered.lock().clone()
    }
}

/// Page surface produced by the raster fallback: the URL is known
/// immediately, the natural size only once the background load completes.
pub struct RasterSurface {
    url: String,
    loaded: Mutex<Option<RenderImage>>,
}

impl RasterSurface {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            loaded: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn complete_load(&self, image: RenderImage) {
        *self.loaded.lock() = Some(image);
    }

    pub fn natural_size(&self) -> Option<(u32, u32)> {
        self.loaded.lock().as_ref().map(|i| (i.width, i.height))
    }
}

pub enum PageSurface {
    Vector(VectorSurface),
    Raster(RasterSurface),
}

impl PageSurface {
    /// Rendered size as currently known. `None` for a raster page whose
    /// image has not reported its dimensions yet.
    pub fn display_size(&self) -> Option<(u32, u32)> {
        match self {
            PageSurface::Vector(s) => Some(s.size()),
            PageSurface::Raster(s) => s.natural_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// Transparent overlay aligned to one page surface. The size is interior
/// mutable because raster overlays are created at 0x0 and resized once the
/// backing image reports its natural dimensions; a zero-sized layer draws
/// nothing until the next redraw.
pub struct HighlightLayer {
    page_index: usize,
    inner: Mutex<LayerInner>,
}

#[derive(Default)]
struct LayerInner {
    width: u32,
    height: u32,
    boxes: Vec<LayerBox>,
}

impl HighlightLayer {
    pub fn new(page_index: usize) -> Self {
        Self {
            page_index,
            inner: Mutex::new(LayerInner::default()),
        }
    }

    pub fn with_size(page_index: usize, width: u32, height: u32) -> Self {
        Self {
            page_index,
            inner: Mutex::new(LayerInner {
                width,
                height,
                boxes: Vec::new(),
            }),
        }
    }

    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn resize(&self, width: u32, height: u32) {
        let mut inner = self.inner.lock();
        inner.width = width;
        inner.height = height;
    }

    pub fn size(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.width, inner.height)
    }

    pub fn clear(&self) {
        self.inner.lock().boxes.clear();
    }

    /// Projects normalized rectangles onto this layer using its size *at
    /// call time*, never a cached value. Zero-sized layers draw nothing.
    pub fn draw_rects(&self, rects: &[NormalizedRect]) {
        let mut inner = self.inner.lock();
        if inner.width == 0 || inner.height == 0 {
            return;
        }
        let width = inner.width as f32;
        let height = inner.height as f32;
        for rect in rects {
            let rect = rect.clamp();
            if !rect.is_valid() {
                continue;
            }
            inner.boxes.push(LayerBox {
                left: rect.left * width,
                top: rect.top * height,
                width: (rect.right - rect.left) * width,
                height: (rect.bottom - rect.top) * height,
            });
        }
    }

    pub fn boxes(&self) -> Vec<LayerBox> {
        self.inner.lock().boxes.clone()
    }
}

/// One page surface paired 1:1 with its highlight overlay.
#[derive(Clone)]
pub struct PageSlot {
    pub surface: Arc<PageSurface>,
    pub overlay: Arc<HighlightLayer>,
}

/// Everything currently mounted in the viewing area for one document.
/// Replaced wholesale whenever a different document is opened; no
/// incremental diffing.
pub struct DocumentView {
    doc_id: DocumentId,
    doc_name: String,
    backend: BackendKind,
    slots: Vec<PageSlot>,
}

impl DocumentView {
    pub fn new(
        doc_id: impl Into<DocumentId>,
        doc_name: impl Into<String>,
        backend: BackendKind,
        slots: Vec<PageSlot>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            doc_name: doc_name.into(),
            backend,
            slots,
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn page_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[PageSlot] {
        &self.slots
    }

    pub fn layer_for_page(&self, page_index: usize) -> Option<&Arc<HighlightLayer>> {
        self.slots
            .iter()
            .map(|slot| &slot.overlay)
            .find(|layer| layer.page_index() == page_index)
    }

    pub fn clear_highlights(&self) {
        for slot in &self.slots {
            slot.overlay.clear();
        }
    }
}

/// Full clear-and-redraw of every mounted overlay. If a highlight targets a
/// page whose layer is not mounted, the highlight is skipped silently;
/// layers appear asynchronously and the next redraw picks them up.
pub fn redraw_highlights(view: &DocumentView, results: &[SearchResult]) {
    view.clear_highlights();
    let Some(result) = results.iter().find(|r| r.doc_id == view.doc_id) else {
        return;
    };
    for highlight in &result.highlights {
        match view.layer_for_page(highlight.page) {
            Some(layer) => layer.draw_rects(&highlight.rects),
            None => {
                debug!(
                    doc_id = %view.doc_id,
                    page = highlight.page,
                    "highlight target layer not mounted; skipping"
                );
            }
        }
    }
}

/// Known documents plus the list view's name filter. Hit counts are never
/// stored here; they are recomputed from the current results on demand.
#[derive(Debug, Default)]
pub struct DocumentRegistry {
    docs: Vec<DocumentSummary>,
    filter: String,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_documents(&mut self, docs: Vec<DocumentSummary>) {
        self.docs = docs;
    }

    pub fn documents(&self) -> &[DocumentSummary] {
        &self.docs
    }

    pub fn get(&self, doc_id: &str) -> Option<&DocumentSummary> {
        self.docs.iter().find(|d| d.doc_id == doc_id)
    }

    pub fn remove(&mut self, doc_id: &str) -> bool {
        let before = self.docs.len();
        self.docs.retain(|d| d.doc_id != doc_id);
        self.docs.len() != before
    }

    pub fn set_filter(&mut self, filter: impl Into<String>) {
        self.filter = filter.into();
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Case-insensitive substring match against the document name.
    pub fn visible(&self) -> impl Iterator<Item = &DocumentSummary> {
        let needle = self.filter.to_lowercase();
        self.docs
            .iter()
            .filter(move |d| needle.is_empty() || d.name.to_lowercase().contains(&needle))
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// Owns the match-order sequence and the cursor into it.
///
/// Two states: `Empty` (no order, cursor `None`) and `Active` (non-empty
/// order, cursor in `[0, len)`). Next/previous clamp at the boundaries,
/// never wrap.
#[derive(Debug, Default)]
pub struct MatchNavigator {
    order: Vec<MatchOrderItem>,
    cursor: Option<usize>,
}

impl MatchNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry transition for a new query: the previous order is discarded
    /// wholesale and the cursor lands on 0, or the navigator goes `Empty`.
    pub fn seed(&mut self, order: Vec<MatchOrderItem>) {
        self.cursor = if order.is_empty() { None } else { Some(0) };
        self.order = order;
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.cursor = None;
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn current(&self) -> Option<&MatchOrderItem> {
        self.order.get(self.cursor?)
    }

    pub fn order(&self) -> &[MatchOrderItem] {
        &self.order
    }

    pub fn can_go_previous(&self) -> bool {
        matches!(self.cursor, Some(c) if c > 0)
    }

    pub fn can_go_next(&self) -> bool {
        matches!(self.cursor, Some(c) if c + 1 < self.order.len())
    }

    /// Moves the cursor by `delta`, clamped to `[0, len)`. Returns whether
    /// it actually moved; a boundary click is a no-op.
    pub fn advance(&mut self, delta: isize) -> bool {
        let Some(cursor) = self.cursor else {
            return false;
        };
        let last = self.order.len() as isize - 1;
        let next = (cursor as isize + delta).clamp(0, last) as usize;
        if next != cursor {
            self.cursor = Some(next);
            true
        } else {
            false
        }
    }

    /// Jumps straight to `index`. Out-of-range selections are ignored.
    pub fn select(&mut self, index: usize) -> bool {
        if index < self.order.len() {
            self.cursor = Some(index);
            true
        } else {
            false
        }
    }

    /// Strips every order entry referencing `doc_id`, preserving the
    /// relative order of the rest. If the cursor's target survives, the
    /// cursor follows it; otherwise it clamps to the remaining sequence or
    /// goes `Empty`.
    pub fn remove_document(&mut self, doc_id: &str) {
        let old_cursor = self.cursor;
        let mut new_cursor_for_survivor = None;
        let mut kept = Vec::with_capacity(self.order.len());
        for (idx, item) in self.order.drain(..).enumerate() {
            if item.doc_id == doc_id {
                continue;
            }
            if Some(idx) == old_cursor {
                new_cursor_for_survivor = Some(kept.len());
            }
            kept.push(item);
        }
        self.order = kept;
        self.cursor = if self.order.is_empty() {
            None
        } else {
            match (new_cursor_for_survivor, old_cursor) {
                (Some(c), _) => Some(c),
                (None, Some(old)) => Some(old.min(self.order.len() - 1)),
                (None, None) => None,
            }
        };
    }

    pub fn status_line(&self) -> String {
        match (self.cursor, self.current()) {
            (Some(cursor), Some(item)) => format!(
                "Match {} / {} \u{2022} {} p.{}",
                cursor + 1,
                self.order.len(),
                item.doc_name,
                item.page + 1
            ),
            _ => "No matches".to_string(),
        }
    }
}

/// Produces a mounted-ready view for a document: one page surface and one
/// aligned overlay per page, in page order.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn open(&self, doc: &DocumentSummary) -> Result<DocumentView>;
}

/// The HTTP document store, as consumed by the core.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>>;
    async fn delete_document(&self, doc_id: &str) -> Result<bool>;
    async fn fetch_document(&self, doc_id: &str) -> Result<Vec<u8>>;
    async fn fetch_manifest(&self, doc_id: &str) -> Result<PageManifest>;
    async fn fetch_page_image(&self, doc_id: &str, page: usize, scale: f32) -> Result<Vec<u8>>;
    fn page_image_url(&self, doc_id: &str, page: usize, scale: f32) -> String;
}

/// The natural-language search engine.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn ask(&self, message: &str) -> Result<ChatResponse>;
}

/// Presentation seam: where views are mounted, pages scrolled and status
/// reported. The session drives this; implementations decide how to show it.
pub trait Viewport: Send + Sync {
    fn mount(&self, view: &DocumentView);
    fn scroll_to_page(&self, page_index: usize);
    fn show_placeholder(&self);
    fn show_empty_results(&self);
    fn set_status(&self, text: &str);
    fn set_navigation(&self, previous_enabled: bool, next_enabled: bool);
    fn notify(&self, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Empty or whitespace-only input; nothing was sent.
    Ignored,
    NoMatches,
    Matches(usize),
}

/// Single owner of all navigation state: the registry, the current query's
/// results, the match cursor and the open view. Every mutation goes through
/// this struct; a new query or a clear swaps results, order and cursor
/// together, never piecemeal.
#[derive(Default)]
pub struct ViewerSession {
    registry: DocumentRegistry,
    results: Vec<SearchResult>,
    navigator: MatchNavigator,
    open_view: Option<DocumentView>,
}

impl ViewerSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DocumentRegistry {
        &mut self.registry
    }

    pub fn results(&self) -> &[SearchResult] {
        &self.results
    }

    pub fn navigator(&self) -> &MatchNavigator {
        &self.navigator
    }

    pub fn open_view(&self) -> Option<&DocumentView> {
        self.open_view.as_ref()
    }

    /// Per-document hit count for the list view, recomputed from the
    /// current results on every call.
    pub fn hit_count(&self, doc_id: &str) -> usize {
        self.results
            .iter()
            .find(|r| r.doc_id == doc_id)
            .map(|r| r.total_hits)
            .unwrap_or(0)
    }

    pub fn visible_documents(&self) -> Vec<(&DocumentSummary, usize)> {
        self.registry
            .visible()
            .map(|doc| {
                let hits = self.hit_count(&doc.doc_id);
                (doc, hits)
            })
            .collect()
    }

    pub async fn refresh_documents(&mut self, store: &dyn DocumentStore) -> Result<()> {
        let docs = store.list_documents().await?;
        self.registry.set_documents(docs);
        Ok(())
    }

    /// Sends a question to the search engine and seeds navigation from the
    /// response. Results and order are replaced wholesale; nothing is merged
    /// with a previous query. A transport failure propagates and leaves the
    /// prior state intact.
    pub async fn submit_query(
        &mut self,
        text: &str,
        search: &dyn SearchClient,
        renderer: &dyn DocumentRenderer,
        viewport: &dyn Viewport,
    ) -> Result<QueryOutcome> {
        if text.trim().is_empty() {
            return Ok(QueryOutcome::Ignored);
        }
        let response = search.ask(text).await?;
        self.results = response.results;
        self.navigator.seed(response.order);
        if self.navigator.is_empty() {
            // The open view still shows the previous query's boxes; redraw
            // from the replaced results so nothing stale survives.
            if let Some(view) = &self.open_view {
                redraw_highlights(view, &self.results);
            }
            viewport.show_empty_results();
            self.publish_navigation(viewport);
            return Ok(QueryOutcome::NoMatches);
        }
        self.go_to_current(renderer, viewport).await?;
        Ok(QueryOutcome::Matches(self.navigator.len()))
    }

    pub async fn next_match(
        &mut self,
        renderer: &dyn DocumentRenderer,
        viewport: &dyn Viewport,
    ) -> Result<()> {
        if self.navigator.advance(1) {
            self.go_to_current(renderer, viewport).await?;
        }
        Ok(())
    }

    pub async fn previous_match(
        &mut self,
        renderer: &dyn DocumentRenderer,
        viewport: &dyn Viewport,
    ) -> Result<()> {
        if self.navigator.advance(-1) {
            self.go_to_current(renderer, viewport).await?;
        }
        Ok(())
    }

    pub async fn select_match(
        &mut self,
        index: usize,
        renderer: &dyn DocumentRenderer,
        viewport: &dyn Viewport,
    ) -> Result<()> {
        if self.navigator.select(index) {
            self.go_to_current(renderer, viewport).await?;
        }
        Ok(())
    }

    /// Opens a document directly from the list view, replacing whatever is
    /// currently rendered, and redraws its highlights from the current
    /// results.
    pub async fn open_document(
        &mut self,
        doc_id: &str,
        renderer: &dyn DocumentRenderer,
        viewport: &dyn Viewport,
    ) -> Result<()> {
        let Some(doc) = self.registry.get(doc_id).cloned() else {
            viewport.notify(&format!("unknown document {doc_id}"));
            return Ok(());
        };
        let view = renderer.open(&doc).await?;
        viewport.mount(&view);
        redraw_highlights(&view, &self.results);
        self.open_view = Some(view);
        Ok(())
    }

    /// Deletes a document at the store and repairs navigation state. A
    /// store-side refusal is surfaced as a transient notice and leaves the
    /// local state unchanged.
    pub async fn delete_document(
        &mut self,
        doc_id: &str,
        store: &dyn DocumentStore,
        viewport: &dyn Viewport,
    ) -> Result<bool> {
        if !store.delete_document(doc_id).await? {
            viewport.notify(&format!("could not delete {doc_id}"));
            return Ok(false);
        }
        self.registry.remove(doc_id);
        self.results.retain(|r| r.doc_id != doc_id);
        self.navigator.remove_document(doc_id);
        if self
            .open_view
            .as_ref()
            .is_some_and(|view| view.doc_id() == doc_id)
        {
            self.open_view = None;
            viewport.show_placeholder();
        }
        self.publish_navigation(viewport);
        Ok(true)
    }

    /// Explicit clear: discard results and order, clear every mounted
    /// highlight layer and return the navigator to `Empty`.
    pub fn clear_query(&mut self, viewport: &dyn Viewport) {
        self.results.clear();
        self.navigator.clear();
        if let Some(view) = &self.open_view {
            view.clear_highlights();
        }
        self.publish_navigation(viewport);
    }

    /// The "go to" side effects for the cursor's current target: open the
    /// document if it is not the open one, redraw, scroll, report.
    async fn go_to_current(
        &mut self,
        renderer: &dyn DocumentRenderer,
        viewport: &dyn Viewport,
    ) -> Result<()> {
        let Some(target) = self.navigator.current().cloned() else {
            self.publish_navigation(viewport);
            return Ok(());
        };
        let already_open = self
            .open_view
            .as_ref()
            .is_some_and(|view| view.doc_id() == target.doc_id);
        if !already_open {
            let doc = self.registry.get(&target.doc_id).cloned().unwrap_or_else(|| {
                // A match can outlive the listing (e.g. stale order after a
                // registry refresh); the pipeline resolves the page count
                // itself, so a thin summary is enough to open it.
                DocumentSummary {
                    doc_id: target.doc_id.clone(),
                    name: target.doc_name.clone(),
                    pages: 0,
                    sha256: None,
                    uploaded_at: None,
                }
            });
            let view = renderer.open(&doc).await?;
            viewport.mount(&view);
            self.open_view = Some(view);
        }
        if let Some(view) = &self.open_view {
            redraw_highlights(view, &self.results);
            if view.layer_for_page(target.page).is_some() {
                viewport.scroll_to_page(target.page);
            } else {
                // Layer not mounted yet; the scroll is skipped for this
                // call and is not retried when the open completes.
                debug!(
                    doc_id = %target.doc_id,
                    page = target.page,
                    "scroll target layer not mounted; skipping"
                );
            }
        }
        self.publish_navigation(viewport);
        Ok(())
    }

    fn publish_navigation(&self, viewport: &dyn Viewport) {
        viewport.set_status(&self.navigator.status_line());
        viewport.set_navigation(
            self.navigator.can_go_previous(),
            self.navigator.can_go_next(),
        );
    }
}

#[derive(Debug, Clone, Default)]
pub struct DraftRequest {
    pub question: String,
    pub findings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Draft {
    pub subject: String,
    pub body: String,
}

/// Draft-generation collaborator. `generate_draft` always resolves; an
/// implementation that loses its model is expected to fall back internally
/// rather than surface an error.
#[async_trait]
pub trait DraftAssistant: Send + Sync {
    fn status(&self) -> String;
    /// Observable status; polling `status()` remains a legitimate fallback.
    fn status_stream(&self) -> watch::Receiver<String>;
    async fn generate_draft(&self, request: DraftRequest) -> Draft;
    fn can_enable_cdn(&self) -> bool;
    async fn enable_cdn(&self) -> Result<()>;
}

/// Built-in fallback writer: deterministic template output, no model, no
/// remote sources.
pub struct TemplateDraftWriter {
    status: watch::Sender<String>,
}

impl TemplateDraftWriter {
    pub fn new() -> Self {
        let (status, _) = watch::channel("template draft writer ready".to_string());
        Self { status }
    }
}

impl Default for TemplateDraftWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DraftAssistant for TemplateDraftWriter {
    fn status(&self) -> String {
        self.status.borrow().clone()
    }

    fn status_stream(&self) -> watch::Receiver<String> {
        self.status.subscribe()
    }

    async fn generate_draft(&self, request: DraftRequest) -> Draft {
        let subject = if request.question.trim().is_empty() {
            "Case findings".to_string()
        } else {
            format!("Findings: {}", request.question.trim())
        };
        let body = if request.findings.is_empty() {
            "No matching values were found in the uploaded documents.".to_string()
        } else {
            let mut body = String::from("The following values were located:\n");
            for finding in &request.findings {
                body.push_str("- ");
                body.push_str(finding);
                body.push('\n');
            }
            body
        };
        self.status
            .send_replace("draft generated from template".to_string());
        Draft { subject, body }
    }

    fn can_enable_cdn(&self) -> bool {
        false
    }

    async fn enable_cdn(&self) -> Result<()> {
        Err(anyhow!("no remote model source configured"))
    }
}
