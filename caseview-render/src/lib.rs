use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use caseview_core::{
    BackendKind, DocumentRenderer, DocumentStore, DocumentSummary, DocumentView, HighlightLayer,
    PageSlot, PageSurface, RasterSurface, RenderImage, VectorSurface,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

/// Fixed display scale shared by both backends; the store's page-image
/// endpoint rasterizes at the same factor.
pub const DISPLAY_SCALE: f32 = 1.25;

/// Preference id honored by the backend selector; a persisted value
/// overrides the command-line opt-in for remote engine sources.
pub const REMOTE_ENGINE_PREF_KEY: &str = "caseview.allow-remote-engine";

const ENGINE_POLL_ATTEMPTS: u32 = 30;
const ENGINE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Persisted user preferences, stored as TOML in the platform config dir.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnginePreferences {
    #[serde(default)]
    flags: BTreeMap<String, bool>,
}

impl EnginePreferences {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read preferences at {:?}", path))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse preferences at {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create preferences directory {:?}", parent))?;
        }
        let payload = toml::to_string_pretty(self)?;
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, payload)
            .with_context(|| format!("failed to write temp preferences file {:?}", tmp))?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<bool> {
        self.flags.get(key).copied()
    }

    pub fn set(&mut self, key: impl Into<String>, value: bool) {
        self.flags.insert(key.into(), value);
    }
}

/// Ordered engine sources: the local vendor path is always tried first;
/// remote sources only when the opt-in allows.
#[derive(Debug, Clone, Default)]
pub struct EngineSources {
    pub vendor_path: Option<PathBuf>,
    pub remote: Vec<Url>,
    pub allow_remote: bool,
}

impl EngineSources {
    /// Applies the persisted preference override for the remote opt-in.
    pub fn with_preferences(mut self, prefs: &EnginePreferences) -> Self {
        if let Some(value) = prefs.get(REMOTE_ENGINE_PREF_KEY) {
            self.allow_remote = value;
        }
        self
    }
}

/// A successfully bound vector engine plus the background worker path
/// derived from the winning source.
pub struct VectorEngine {
    renderer: Arc<dyn VectorPageRenderer>,
    worker_path: PathBuf,
}

impl VectorEngine {
    pub fn new(renderer: Arc<dyn VectorPageRenderer>, worker_path: PathBuf) -> Self {
        Self {
            renderer,
            worker_path,
        }
    }

    pub fn renderer(&self) -> &Arc<dyn VectorPageRenderer> {
        &self.renderer
    }

    pub fn worker_path(&self) -> &Path {
        &self.worker_path
    }
}

/// Worker path convention: a sibling of the engine library, same directory.
pub fn worker_path_for(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("engine");
    let name = match source.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}.worker.{ext}"),
        None => format!("{stem}.worker"),
    };
    source.with_file_name(name)
}

pub trait VectorPageRenderer: Send + Sync {
    fn open(&self, bytes: Vec<u8>) -> Result<Box<dyn VectorDocument>>;
}

pub trait VectorDocument: Send {
    fn page_count(&self) -> usize;
    /// Page size in document points, before the display scale is applied.
    fn page_size(&self, page_index: usize) -> Result<(f32, f32)>;
    fn render_page(&self, page_index: usize, scale: f32) -> Result<RenderImage>;
}

/// Binds one engine source. Kept behind a trait so the selection protocol
/// can be exercised without a real engine library on disk.
pub trait EngineBinder: Send + Sync {
    fn bind_local(&self, path: &Path) -> Result<VectorEngine>;
    fn bind_remote(&self, url: &Url, cache_dir: &Path) -> Result<VectorEngine>;
}

enum EngineSlot {
    Unresolved,
    Loading,
    Ready(Arc<VectorEngine>),
    Unavailable,
}

/// Lazily-initialized engine selector. Selection runs at most once per
/// session; every later call returns the cached outcome. When a concurrent
/// load is already in flight, callers poll briefly for it to finish instead
/// of starting a second one.
pub struct VectorEngineService {
    sources: EngineSources,
    binder: Arc<dyn EngineBinder>,
    cache_dir: PathBuf,
    slot: Mutex<EngineSlot>,
}

impl VectorEngineService {
    pub fn new(sources: EngineSources, binder: Arc<dyn EngineBinder>, cache_dir: PathBuf) -> Self {
        Self {
            sources,
            binder,
            cache_dir,
            slot: Mutex::new(EngineSlot::Unresolved),
        }
    }

    /// Installs an engine that is already loaded in the process, making the
    /// selection a no-op for the rest of the session.
    pub fn install(&self, engine: VectorEngine) {
        let mut slot = self.slot.lock();
        if matches!(*slot, EngineSlot::Unresolved) {
            *slot = EngineSlot::Ready(Arc::new(engine));
        }
    }

    /// Resolves the vector engine, or `None` once the session has fallen
    /// back to the raster backend. The fallback is silent; failures are
    /// only logged.
    pub async fn acquire(&self) -> Option<Arc<VectorEngine>> {
        enum Plan {
            Done(Option<Arc<VectorEngine>>),
            Load,
            Wait,
        }

        let plan = {
            let mut slot = self.slot.lock();
            match &*slot {
                EngineSlot::Ready(engine) => Plan::Done(Some(Arc::clone(engine))),
                EngineSlot::Unavailable => Plan::Done(None),
                EngineSlot::Loading => Plan::Wait,
                EngineSlot::Unresolved => {
                    *slot = EngineSlot::Loading;
                    Plan::Load
                }
            }
        };

        match plan {
            Plan::Done(outcome) => outcome,
            Plan::Load => {
                let binder = Arc::clone(&self.binder);
                let sources = self.sources.clone();
                let cache_dir = self.cache_dir.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || try_sources(&*binder, &sources, &cache_dir))
                        .await
                        .unwrap_or_else(|err| {
                            warn!(?err, "engine load task failed");
                            None
                        });
                let mut slot = self.slot.lock();
                match outcome {
                    Some(engine) => {
                        let engine = Arc::new(engine);
                        *slot = EngineSlot::Ready(Arc::clone(&engine));
                        Some(engine)
                    }
                    None => {
                        warn!("no vector engine source resolved; using raster backend for this session");
                        *slot = EngineSlot::Unavailable;
                        None
                    }
                }
            }
            Plan::Wait => {
                for _ in 0..ENGINE_POLL_ATTEMPTS {
                    tokio::time::sleep(ENGINE_POLL_INTERVAL).await;
                    let slot = self.slot.lock();
                    match &*slot {
                        EngineSlot::Ready(engine) => return Some(Arc::clone(engine)),
                        EngineSlot::Unavailable => return None,
                        _ => {}
                    }
                }
                debug!("concurrent engine load did not settle within the poll window");
                None
            }
        }
    }
}

fn try_sources(
    binder: &dyn EngineBinder,
    sources: &EngineSources,
    cache_dir: &Path,
) -> Option<VectorEngine> {
    if let Some(path) = &sources.vendor_path {
        match binder.bind_local(path) {
            Ok(engine) => return Some(engine),
            Err(err) => warn!(?err, path = %path.display(), "vendor engine path did not bind"),
        }
    }
    if sources.allow_remote {
        for url in &sources.remote {
            match binder.bind_remote(url, cache_dir) {
                Ok(engine) => return Some(engine),
                Err(err) => warn!(?err, %url, "remote engine source did not bind"),
            }
        }
    } else if !sources.remote.is_empty() {
        debug!("remote engine sources configured but the opt-in is off");
    }
    None
}

/// Produces one page surface plus one aligned overlay per page, through
/// whichever backend the engine selector settles on.
pub struct RenderingPipeline {
    engine: Arc<VectorEngineService>,
    store: Arc<dyn DocumentStore>,
    scale: f32,
}

impl RenderingPipeline {
    pub fn new(engine: Arc<VectorEngineService>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            engine,
            store,
            scale: DISPLAY_SCALE,
        }
    }

    async fn open_vector(
        &self,
        engine: Arc<VectorEngine>,
        doc: &DocumentSummary,
    ) -> Result<DocumentView> {
        let bytes = self.store.fetch_document(&doc.doc_id).await?;
        let renderer = Arc::clone(engine.renderer());
        let mut document = tokio::task::spawn_blocking(move || renderer.open(bytes))
            .await
            .context("vector open task failed")??;

        let page_count = document.page_count();
        let scale = self.scale;

        // Every surface and its identically-sized overlay exist before any
        // page renders; highlight drawing never waits for pixels.
        let mut slots = Vec::with_capacity(page_count);
        for page in 0..page_count {
            let (width_pts, height_pts) = document.page_size(page)?;
            let width = (width_pts * scale).round().max(1.0) as u32;
            let height = (height_pts * scale).round().max(1.0) as u32;
            slots.push(PageSlot {
                surface: Arc::new(PageSurface::Vector(VectorSurface::new(width, height))),
                overlay: Arc::new(HighlightLayer::with_size(page, width, height)),
            });
        }

        // Strictly sequential: page N+1 does not start until page N's
        // render settles, bounding peak engine memory.
        for (page, slot) in slots.iter().enumerate() {
            let (returned, rendered) = tokio::task::spawn_blocking(move || {
                let rendered = document.render_page(page, scale);
                (document, rendered)
            })
            .await
            .context("vector render task failed")?;
            document = returned;
            match rendered {
                Ok(image) => {
                    if let PageSurface::Vector(surface) = slot.surface.as_ref() {
                        surface.complete_render(image);
                    }
                }
                Err(err) => {
                    warn!(?err, doc_id = %doc.doc_id, page, "page render failed; surface left blank")
                }
            }
        }

        Ok(DocumentView::new(
            doc.doc_id.clone(),
            doc.name.clone(),
            BackendKind::Vector,
            slots,
        ))
    }

    async fn open_raster(&self, doc: &DocumentSummary) -> Result<DocumentView> {
        let manifest = self.store.fetch_manifest(&doc.doc_id).await?;
        let page_count = manifest.count.max(manifest.pages.len());

        let mut slots = Vec::with_capacity(page_count);
        for page in 0..page_count {
            let url = self.store.page_image_url(&doc.doc_id, page, self.scale);
            let surface = Arc::new(PageSurface::Raster(RasterSurface::new(url)));
            let overlay = Arc::new(HighlightLayer::new(page));

            // Detached load: each page's image arrives whenever it arrives
            // and resizes only its own overlay. The task holds nothing but
            // Arcs, so it is harmless if the view has been replaced by the
            // time it finishes.
            let store = Arc::clone(&self.store);
            let doc_id = doc.doc_id.clone();
            let scale = self.scale;
            let task_surface = Arc::clone(&surface);
            let task_overlay = Arc::clone(&overlay);
            tokio::spawn(async move {
                match load_page_image(store.as_ref(), &doc_id, page, scale).await {
                    Ok(image) => {
                        let (width, height) = (image.width, image.height);
                        if let PageSurface::Raster(raster) = task_surface.as_ref() {
                            raster.complete_load(image);
                        }
                        // The overlay becomes valid only after its backing
                        // surface has reported a size.
                        task_overlay.resize(width, height);
                    }
                    Err(err) => {
                        warn!(?err, doc_id = %doc_id, page, "page image load failed")
                    }
                }
            });

            slots.push(PageSlot { surface, overlay });
        }

        Ok(DocumentView::new(
            doc.doc_id.clone(),
            doc.name.clone(),
            BackendKind::Raster,
            slots,
        ))
    }
}

#[async_trait]
impl DocumentRenderer for RenderingPipeline {
    async fn open(&self, doc: &DocumentSummary) -> Result<DocumentView> {
        match self.engine.acquire().await {
            Some(engine) => self.open_vector(engine, doc).await,
            None => self.open_raster(doc).await,
        }
    }
}

async fn load_page_image(
    store: &dyn DocumentStore,
    doc_id: &str,
    page: usize,
    scale: f32,
) -> Result<RenderImage> {
    let bytes = store.fetch_page_image(doc_id, page, scale).await?;
    let decoded = image::load_from_memory(&bytes)
        .with_context(|| format!("failed to decode page image {doc_id}/{page}"))?;
    let rgba = decoded.to_rgba8();
    Ok(RenderImage {
        width: rgba.width(),
        height: rgba.height(),
        pixels: rgba.into_raw(),
    })
}

/// Default binder wired to the pdfium engine; without the `pdf` feature
/// every source fails to bind and the session runs on the raster backend.
pub fn default_engine_service(sources: EngineSources, cache_dir: PathBuf) -> Arc<VectorEngineService> {
    #[cfg(feature = "pdf")]
    let binder: Arc<dyn EngineBinder> = Arc::new(pdfium::PdfiumBinder);
    #[cfg(not(feature = "pdf"))]
    let binder: Arc<dyn EngineBinder> = Arc::new(DisabledBinder);
    Arc::new(VectorEngineService::new(sources, binder, cache_dir))
}

#[cfg(not(feature = "pdf"))]
struct DisabledBinder;

#[cfg(not(feature = "pdf"))]
impl EngineBinder for DisabledBinder {
    fn bind_local(&self, _path: &Path) -> Result<VectorEngine> {
        Err(anyhow::anyhow!("vector engine support is not compiled in"))
    }

    fn bind_remote(&self, _url: &Url, _cache_dir: &Path) -> Result<VectorEngine> {
        Err(anyhow::anyhow!("vector engine support is not compiled in"))
    }
}

#[cfg(feature = "pdf")]
mod pdfium {
    use std::io::Read;
    use std::mem;

    use anyhow::anyhow;
    use pdfium_render::prelude::*;
    use tempfile::NamedTempFile;

    use super::*;

    pub struct PdfiumBinder;

    impl EngineBinder for PdfiumBinder {
        fn bind_local(&self, path: &Path) -> Result<VectorEngine> {
            let bindings = Pdfium::bind_to_library(path)
                .map_err(|err| anyhow!("failed to bind engine library {:?}: {err}", path))?;
            Ok(VectorEngine::new(
                Arc::new(PdfiumRenderer {
                    pdfium: Arc::new(Pdfium::new(bindings)),
                }),
                worker_path_for(path),
            ))
        }

        fn bind_remote(&self, url: &Url, cache_dir: &Path) -> Result<VectorEngine> {
            let file_name = url
                .path_segments()
                .and_then(|segments| segments.last())
                .filter(|name| !name.is_empty())
                .unwrap_or("engine.bin")
                .to_string();
            fs::create_dir_all(cache_dir)
                .with_context(|| format!("failed to create engine cache dir {:?}", cache_dir))?;
            let target = cache_dir.join(file_name);
            if !target.exists() {
                download_engine(url, &target)?;
            }
            self.bind_local(&target)
        }
    }

    fn download_engine(url: &Url, target: &Path) -> Result<()> {
        let response = ureq::get(url.as_str())
            .call()
            .map_err(|err| anyhow!("failed to fetch engine from {url}: {err}"))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .with_context(|| format!("failed to read engine payload from {url}"))?;
        let tmp = target.with_extension("partial");
        fs::write(&tmp, &bytes)
            .with_context(|| format!("failed to write engine cache file {:?}", tmp))?;
        fs::rename(&tmp, target)?;
        Ok(())
    }

    struct PdfiumRenderer {
        pdfium: Arc<Pdfium>,
    }

    impl VectorPageRenderer for PdfiumRenderer {
        fn open(&self, bytes: Vec<u8>) -> Result<Box<dyn VectorDocument>> {
            let file = NamedTempFile::new().context("failed to create spool file")?;
            fs::write(file.path(), &bytes).context("failed to spool document bytes")?;
            let document = PdfiumVectorDocument::open(Arc::clone(&self.pdfium), file)?;
            Ok(Box::new(document))
        }
    }

    struct PdfiumVectorDocument {
        document: parking_lot::Mutex<Option<PdfDocument<'static>>>,
        page_count: usize,
        file: NamedTempFile,
        pdfium: Arc<Pdfium>,
    }

    impl PdfiumVectorDocument {
        fn open(pdfium: Arc<Pdfium>, file: NamedTempFile) -> Result<Self> {
            let mut doc = Self {
                document: parking_lot::Mutex::new(None),
                page_count: 0,
                file,
                pdfium,
            };
            doc.page_count = doc.with_document(|d| Ok(d.pages().len() as usize))?;
            Ok(doc)
        }

        fn load_document(&self) -> Result<PdfDocument<'static>> {
            let document = self
                .pdfium
                .load_pdf_from_file(self.file.path(), None)
                .with_context(|| format!("failed to open spooled document {:?}", self.file.path()))?;
            // SAFETY: the returned PdfDocument holds a reference to the
            // Pdfium bindings owned by self.pdfium. The document is stored
            // inside self.document and dropped before the Pdfium instance
            // because struct fields drop in declaration order (document
            // precedes pdfium), so the reference stays valid for the cached
            // document's lifetime.
            let document =
                unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
            Ok(document)
        }

        fn with_document<R, F>(&self, f: F) -> Result<R>
        where
            F: FnOnce(&PdfDocument<'static>) -> Result<R>,
        {
            let mut guard = self.document.lock();
            if guard.is_none() {
                *guard = Some(self.load_document()?);
            }
            let document = guard.as_ref().expect("document must be loaded");
            f(document)
        }
    }

    impl VectorDocument for PdfiumVectorDocument {
        fn page_count(&self) -> usize {
            self.page_count
        }

        fn page_size(&self, page_index: usize) -> Result<(f32, f32)> {
            self.with_document(|document| {
                let index: PdfPageIndex = page_index
                    .try_into()
                    .map_err(|_| anyhow!("page {} is out of supported range", page_index))?;
                let page = document
                    .pages()
                    .get(index)
                    .with_context(|| format!("page {} out of range", page_index))?;
                Ok((page.width().value, page.height().value))
            })
        }

        fn render_page(&self, page_index: usize, scale: f32) -> Result<RenderImage> {
            self.with_document(|document| {
                let index: PdfPageIndex = page_index
                    .try_into()
                    .map_err(|_| anyhow!("page {} is out of supported range", page_index))?;
                let page = document
                    .pages()
                    .get(index)
                    .with_context(|| format!("page {} out of range", page_index))?;
                let config = PdfRenderConfig::new().scale_page_by_factor(scale.max(0.1));
                let bitmap = page
                    .render_with_config(&config)
                    .with_context(|| format!("failed to render page {}", page_index))?;
                let image = bitmap.as_image().to_rgba8();
                let (width, height) = (image.width(), image.height());
                Ok(RenderImage {
                    width,
                    height,
                    pixels: image.into_raw(),
                })
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use anyhow::anyhow;
    use caseview_core::{PageDimensions, PageManifest};

    struct FakeVectorDocument {
        sizes: Vec<(f32, f32)>,
        fail_page: Option<usize>,
        rendered: Arc<Mutex<Vec<usize>>>,
    }

    impl VectorDocument for FakeVectorDocument {
        fn page_count(&self) -> usize {
            self.sizes.len()
        }

        fn page_size(&self, page_index: usize) -> Result<(f32, f32)> {
            self.sizes
                .get(page_index)
                .copied()
                .ok_or_else(|| anyhow!("page {page_index} out of range"))
        }

        fn render_page(&self, page_index: usize, scale: f32) -> Result<RenderImage> {
            self.rendered.lock().push(page_index);
            if self.fail_page == Some(page_index) {
                return Err(anyhow!("render failed"));
            }
            let (w, h) = self.sizes[page_index];
            let width = (w * scale).round() as u32;
            let height = (h * scale).round() as u32;
            Ok(RenderImage {
                width,
                height,
                pixels: vec![0; (width * height * 4) as usize],
            })
        }
    }

    struct FakeVectorRenderer {
        sizes: Vec<(f32, f32)>,
        fail_page: Option<usize>,
        rendered: Arc<Mutex<Vec<usize>>>,
    }

    impl VectorPageRenderer for FakeVectorRenderer {
        fn open(&self, _bytes: Vec<u8>) -> Result<Box<dyn VectorDocument>> {
            Ok(Box::new(FakeVectorDocument {
                sizes: self.sizes.clone(),
                fail_page: self.fail_page,
                rendered: Arc::clone(&self.rendered),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingBinder {
        local_ok: bool,
        remote_ok: bool,
        delay: Option<Duration>,
        sizes: Vec<(f32, f32)>,
        fail_page: Option<usize>,
        local_calls: Mutex<Vec<PathBuf>>,
        remote_calls: Mutex<Vec<String>>,
        rendered: Arc<Mutex<Vec<usize>>>,
    }

    impl RecordingBinder {
        fn engine(&self, source: &Path) -> VectorEngine {
            VectorEngine::new(
                Arc::new(FakeVectorRenderer {
                    sizes: self.sizes.clone(),
                    fail_page: self.fail_page,
                    rendered: Arc::clone(&self.rendered),
                }),
                worker_path_for(source),
            )
        }
    }

    impl EngineBinder for RecordingBinder {
        fn bind_local(&self, path: &Path) -> Result<VectorEngine> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.local_calls.lock().push(path.to_path_buf());
            if self.local_ok {
                Ok(self.engine(path))
            } else {
                Err(anyhow!("no library at {:?}", path))
            }
        }

        fn bind_remote(&self, url: &Url, cache_dir: &Path) -> Result<VectorEngine> {
            self.remote_calls.lock().push(url.to_string());
            if self.remote_ok {
                Ok(self.engine(&cache_dir.join("engine.bin")))
            } else {
                Err(anyhow!("remote source unreachable"))
            }
        }
    }

    #[derive(Default)]
    struct FakeRasterStore {
        manifest_pages: usize,
        png: Vec<u8>,
        calls: Mutex<Vec<String>>,
    }

    fn tiny_png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[async_trait]
    impl DocumentStore for FakeRasterStore {
        async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
            Ok(Vec::new())
        }

        async fn delete_document(&self, _doc_id: &str) -> Result<bool> {
            Ok(false)
        }

        async fn fetch_document(&self, doc_id: &str) -> Result<Vec<u8>> {
            self.calls.lock().push(format!("file:{doc_id}"));
            Ok(vec![b'%', b'P', b'D', b'F'])
        }

        async fn fetch_manifest(&self, doc_id: &str) -> Result<PageManifest> {
            self.calls.lock().push(format!("manifest:{doc_id}"));
            Ok(PageManifest {
                count: self.manifest_pages,
                pages: vec![
                    PageDimensions {
                        width: 1.0,
                        height: 1.0,
                    };
                    self.manifest_pages
                ],
            })
        }

        async fn fetch_page_image(&self, doc_id: &str, page: usize, _scale: f32) -> Result<Vec<u8>> {
            self.calls.lock().push(format!("page:{doc_id}:{page}"));
            Ok(self.png.clone())
        }

        fn page_image_url(&self, doc_id: &str, page: usize, scale: f32) -> String {
            format!("/api/doc/{doc_id}/page/{page}.png?scale={scale}")
        }
    }

    fn summary(doc_id: &str, name: &str, pages: usize) -> DocumentSummary {
        DocumentSummary {
            doc_id: doc_id.to_string(),
            name: name.to_string(),
            pages,
            sha256: None,
            uploaded_at: None,
        }
    }

    #[test]
    fn worker_path_is_a_sibling_of_the_source() {
        assert_eq!(
            worker_path_for(Path::new("/opt/engine/libpdfium.so")),
            PathBuf::from("/opt/engine/libpdfium.worker.so")
        );
        assert_eq!(
            worker_path_for(Path::new("/opt/engine/pdfium")),
            PathBuf::from("/opt/engine/pdfium.worker")
        );
    }

    #[test]
    fn preferences_round_trip_and_override_the_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.toml");

        let mut prefs = EnginePreferences::default();
        prefs.set(REMOTE_ENGINE_PREF_KEY, true);
        prefs.save(&path).unwrap();

        let restored = EnginePreferences::load(&path).unwrap();
        assert_eq!(restored.get(REMOTE_ENGINE_PREF_KEY), Some(true));

        let sources = EngineSources {
            allow_remote: false,
            ..EngineSources::default()
        }
        .with_preferences(&restored);
        assert!(sources.allow_remote);

        // Missing file means no override.
        let empty = EnginePreferences::load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(empty.get(REMOTE_ENGINE_PREF_KEY), None);
    }

    #[tokio::test]
    async fn vendor_path_wins_and_remote_is_never_tried() {
        let binder = Arc::new(RecordingBinder {
            local_ok: true,
            remote_ok: true,
            sizes: vec![(100.0, 200.0)],
            ..RecordingBinder::default()
        });
        let sources = EngineSources {
            vendor_path: Some(PathBuf::from("/vendor/libpdfium.so")),
            remote: vec![Url::parse("https://cdn.example/engine.bin").unwrap()],
            allow_remote: true,
        };
        let service = VectorEngineService::new(sources, binder.clone(), PathBuf::from("/tmp/x"));

        let engine = service.acquire().await.expect("engine should bind");
        assert_eq!(
            engine.worker_path(),
            Path::new("/vendor/libpdfium.worker.so")
        );
        assert_eq!(binder.local_calls.lock().len(), 1);
        assert!(binder.remote_calls.lock().is_empty());

        // Cached: a second acquire does not touch the binder again.
        service.acquire().await.expect("cached engine");
        assert_eq!(binder.local_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn remote_sources_are_gated_by_the_opt_in() {
        let binder = Arc::new(RecordingBinder {
            local_ok: false,
            remote_ok: true,
            ..RecordingBinder::default()
        });
        let sources = EngineSources {
            vendor_path: Some(PathBuf::from("/vendor/libpdfium.so")),
            remote: vec![Url::parse("https://cdn.example/engine.bin").unwrap()],
            allow_remote: false,
        };
        let service = VectorEngineService::new(sources, binder.clone(), PathBuf::from("/tmp/x"));

        assert!(service.acquire().await.is_none());
        assert!(binder.remote_calls.lock().is_empty());

        // The unavailable outcome is cached for the session.
        assert!(service.acquire().await.is_none());
        assert_eq!(binder.local_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn remote_source_is_used_when_opted_in() {
        let binder = Arc::new(RecordingBinder {
            local_ok: false,
            remote_ok: true,
            sizes: vec![(100.0, 200.0)],
            ..RecordingBinder::default()
        });
        let sources = EngineSources {
            vendor_path: Some(PathBuf::from("/vendor/libpdfium.so")),
            remote: vec![Url::parse("https://cdn.example/engine.bin").unwrap()],
            allow_remote: true,
        };
        let service = VectorEngineService::new(sources, binder.clone(), PathBuf::from("/tmp/x"));

        assert!(service.acquire().await.is_some());
        assert_eq!(
            binder.remote_calls.lock().as_slice(),
            ["https://cdn.example/engine.bin"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_acquire_polls_for_the_in_flight_load() {
        let binder = Arc::new(RecordingBinder {
            local_ok: true,
            delay: Some(Duration::from_millis(250)),
            sizes: vec![(100.0, 200.0)],
            ..RecordingBinder::default()
        });
        let sources = EngineSources {
            vendor_path: Some(PathBuf::from("/vendor/libpdfium.so")),
            ..EngineSources::default()
        };
        let service = Arc::new(VectorEngineService::new(
            sources,
            binder.clone(),
            PathBuf::from("/tmp/x"),
        ));

        let first = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = service.acquire().await;

        assert!(first.await.unwrap().is_some());
        assert!(second.is_some());
        assert_eq!(binder.local_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn installed_engine_short_circuits_selection() {
        let binder = Arc::new(RecordingBinder::default());
        let service = VectorEngineService::new(
            EngineSources::default(),
            binder.clone(),
            PathBuf::from("/tmp/x"),
        );
        service.install(VectorEngine::new(
            Arc::new(FakeVectorRenderer {
                sizes: vec![(10.0, 10.0)],
                fail_page: None,
                rendered: Arc::new(Mutex::new(Vec::new())),
            }),
            PathBuf::from("/vendor/pdfium.worker"),
        ));

        assert!(service.acquire().await.is_some());
        assert!(binder.local_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn vector_open_sizes_overlays_and_renders_sequentially() {
        let rendered = Arc::new(Mutex::new(Vec::new()));
        let binder = Arc::new(RecordingBinder {
            local_ok: true,
            sizes: vec![(100.0, 200.0), (300.0, 400.0)],
            rendered: Arc::clone(&rendered),
            ..RecordingBinder::default()
        });
        let sources = EngineSources {
            vendor_path: Some(PathBuf::from("/vendor/libpdfium.so")),
            ..EngineSources::default()
        };
        let service = Arc::new(VectorEngineService::new(
            sources,
            binder,
            PathBuf::from("/tmp/x"),
        ));
        let store = Arc::new(FakeRasterStore::default());
        let pipeline = RenderingPipeline::new(service, store.clone());

        let view = pipeline.open(&summary("d1", "Payslip.pdf", 2)).await.unwrap();

        assert_eq!(view.backend(), BackendKind::Vector);
        assert_eq!(view.page_count(), 2);
        assert_eq!(view.layer_for_page(0).unwrap().size(), (125, 250));
        assert_eq!(view.layer_for_page(1).unwrap().size(), (375, 500));
        assert_eq!(rendered.lock().as_slice(), [0, 1]);
        assert!(store
            .calls
            .lock()
            .iter()
            .any(|call| call == "file:d1"));
    }

    #[tokio::test]
    async fn failed_page_render_leaves_the_surface_blank_but_open_succeeds() {
        let binder = Arc::new(RecordingBinder {
            local_ok: true,
            sizes: vec![(100.0, 200.0), (100.0, 200.0)],
            fail_page: Some(1),
            ..RecordingBinder::default()
        });
        let sources = EngineSources {
            vendor_path: Some(PathBuf::from("/vendor/libpdfium.so")),
            ..EngineSources::default()
        };
        let service = Arc::new(VectorEngineService::new(
            sources,
            binder,
            PathBuf::from("/tmp/x"),
        ));
        let store = Arc::new(FakeRasterStore::default());
        let pipeline = RenderingPipeline::new(service, store);

        let view = pipeline.open(&summary("d1", "Payslip.pdf", 2)).await.unwrap();

        let rendered: Vec<bool> = view
            .slots()
            .iter()
            .map(|slot| match slot.surface.as_ref() {
                PageSurface::Vector(surface) => surface.is_rendered(),
                PageSurface::Raster(_) => unreachable!(),
            })
            .collect();
        assert_eq!(rendered, [true, false]);
        // The overlay is still sized; highlights do not depend on pixels.
        assert_eq!(view.layer_for_page(1).unwrap().size(), (125, 250));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn raster_overlays_start_at_zero_and_size_on_load() {
        let binder = Arc::new(RecordingBinder::default());
        let service = Arc::new(VectorEngineService::new(
            EngineSources::default(),
            binder,
            PathBuf::from("/tmp/x"),
        ));
        let store = Arc::new(FakeRasterStore {
            manifest_pages: 2,
            png: tiny_png(40, 60),
            ..FakeRasterStore::default()
        });
        let pipeline = RenderingPipeline::new(service, store.clone());

        let view = pipeline.open(&summary("d1", "Payslip.pdf", 2)).await.unwrap();

        assert_eq!(view.backend(), BackendKind::Raster);
        assert_eq!(view.page_count(), 2);
        assert!(store.calls.lock().iter().all(|call| !call.starts_with("file:")));

        // Loads are detached; poll for both overlays to report a size.
        for page in 0..2 {
            let overlay = Arc::clone(view.layer_for_page(page).unwrap());
            let mut sized = overlay.size();
            for _ in 0..200 {
                if sized != (0, 0) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                sized = overlay.size();
            }
            assert_eq!(sized, (40, 60));
        }

        let natural = match view.slots()[0].surface.as_ref() {
            PageSurface::Raster(raster) => raster.natural_size(),
            PageSurface::Vector(_) => unreachable!(),
        };
        assert_eq!(natural, Some((40, 60)));
    }
}
