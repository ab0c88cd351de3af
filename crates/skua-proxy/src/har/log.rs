//! HAR document and page lifecycle.
//!
//! The manager owns the current [`CaptureDocument`]. Recorders bind to the
//! document that was current when their exchange began and keep writing into
//! it, so swapping in a new document never loses or duplicates an entry.
//! Swapped-out documents are handed back live: take a [`CaptureDocument::snapshot`]
//! once the exchanges bound to them have finished.

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use skua_core::har::{Creator, Entry, Har, Page, PageTimings};
use std::sync::Arc;
use std::time::Instant;

/// A HAR document being filled in by in-flight exchanges
#[derive(Debug)]
pub struct CaptureDocument {
    creator: Creator,
    pages: Mutex<Vec<Page>>,
    entries: Mutex<Vec<Arc<Mutex<Entry>>>>,
}

impl CaptureDocument {
    fn new(creator: Creator) -> Self {
        Self {
            creator,
            pages: Mutex::new(Vec::new()),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Append an entry; the caller keeps the handle to fill it in later
    pub(crate) fn add_entry(&self, entry: Entry) -> Arc<Mutex<Entry>> {
        let entry = Arc::new(Mutex::new(entry));
        self.entries.lock().push(Arc::clone(&entry));
        entry
    }

    fn add_page(&self, page: Page) {
        self.pages.lock().push(page);
    }

    fn page(&self, id: &str) -> Option<Page> {
        self.pages.lock().iter().find(|p| p.id == id).cloned()
    }

    fn end_page(&self, id: &str, on_load: i64) {
        if let Some(page) = self.pages.lock().iter_mut().find(|p| p.id == id)
            && page.page_timings.on_load.is_none()
        {
            page.page_timings.on_load = Some(on_load);
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Deep copy of the document as it is right now
    pub fn snapshot(&self) -> Har {
        let mut har = Har::new(self.creator.clone());
        har.log.pages = self.pages.lock().clone();
        // Clone the handles first so no entry lock is taken under the list lock
        let entries: Vec<_> = self.entries.lock().clone();
        har.log.entries = entries.iter().map(|e| e.lock().clone()).collect();
        har
    }
}

#[derive(Debug)]
struct CurrentPage {
    id: String,
    started: Instant,
}

#[derive(Debug, Default)]
struct HarLogState {
    document: Option<Arc<CaptureDocument>>,
    current_page: Option<CurrentPage>,
    page_count: u32,
}

impl HarLogState {
    fn end_page(&mut self) {
        if let (Some(document), Some(page)) = (&self.document, self.current_page.take()) {
            let on_load = page.started.elapsed().as_millis() as i64;
            document.end_page(&page.id, on_load);
            tracing::debug!("Ended page '{}' after {} ms", page.id, on_load);
        }
    }

    fn start_page(&mut self, id: Option<&str>, title: Option<&str>) -> String {
        self.page_count += 1;
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| format!("Page {}", self.page_count));

        if let Some(document) = &self.document {
            document.add_page(Page {
                started_date_time: now_iso8601(),
                id: id.clone(),
                title: title.unwrap_or(&id).to_string(),
                page_timings: PageTimings::default(),
                comment: None,
            });
        }
        self.current_page = Some(CurrentPage {
            id: id.clone(),
            started: Instant::now(),
        });
        id
    }
}

/// Owns the current HAR document and page
#[derive(Debug)]
pub struct HarManager {
    creator: Creator,
    state: Mutex<HarLogState>,
}

impl HarManager {
    pub fn new(creator: Creator) -> Self {
        Self {
            creator,
            state: Mutex::new(HarLogState::default()),
        }
    }

    /// Start a new HAR with a first page, returning the previous one
    pub fn new_har(&self, page_ref: Option<&str>, title: Option<&str>) -> Option<Arc<CaptureDocument>> {
        let mut state = self.state.lock();
        state.end_page();
        let previous = state.document.take();

        state.document = Some(Arc::new(CaptureDocument::new(self.creator.clone())));
        state.page_count = 0;
        let id = state.start_page(page_ref, title);
        tracing::info!("Started new HAR with page '{}'", id);
        previous
    }

    /// End the current page and start another.
    ///
    /// Returns the document as it was right after the old page ended.
    pub fn new_page(&self, page_ref: Option<&str>, title: Option<&str>) -> Option<Har> {
        let mut state = self.state.lock();
        let snapshot = if state.document.is_some() {
            state.end_page();
            state.document.as_ref().map(|d| d.snapshot())
        } else {
            tracing::debug!("No HAR in progress; starting one");
            state.document = Some(Arc::new(CaptureDocument::new(self.creator.clone())));
            state.page_count = 0;
            None
        };
        let id = state.start_page(page_ref, title);
        tracing::info!("Started page '{}'", id);
        snapshot
    }

    /// End the current page without starting another
    pub fn end_page(&self) {
        self.state.lock().end_page();
    }

    /// End the current page and hand back the whole document, leaving none
    pub fn end_har(&self) -> Option<Arc<CaptureDocument>> {
        let mut state = self.state.lock();
        state.end_page();
        state.page_count = 0;
        let document = state.document.take()?;
        drop(state);
        tracing::info!("Ended HAR with {} entries", document.entry_count());
        Some(document)
    }

    /// The current document.
    ///
    /// With `clean`, a fresh document replaces it, continuing the current page,
    /// and the replaced one is returned. Exchanges already bound to the old
    /// document finish writing into it.
    pub fn get_har(&self, clean: bool) -> Option<Arc<CaptureDocument>> {
        if !clean {
            return self.document();
        }

        let mut state = self.state.lock();
        let previous = state.document.take()?;
        let fresh = Arc::new(CaptureDocument::new(self.creator.clone()));
        if let Some(page) = &state.current_page
            && let Some(mut carried) = previous.page(&page.id)
        {
            carried.page_timings = PageTimings::default();
            fresh.add_page(carried);
        }
        state.document = Some(fresh);
        drop(state);

        Some(previous)
    }

    /// The live document, if capture has started
    pub fn document(&self) -> Option<Arc<CaptureDocument>> {
        self.state.lock().document.clone()
    }

    pub fn current_page(&self) -> Option<String> {
        self.state.lock().current_page.as_ref().map(|p| p.id.clone())
    }

    /// Register a new entry with the current document and page, creating
    /// both on first use. Runs under the state lock so a concurrent swap
    /// sees the entry in exactly one document.
    pub(crate) fn register(&self, build: impl FnOnce(&str) -> Entry) -> Arc<Mutex<Entry>> {
        let mut state = self.state.lock();
        let document = match &state.document {
            Some(document) => Arc::clone(document),
            None => {
                tracing::debug!("No HAR in progress; starting one");
                let document = Arc::new(CaptureDocument::new(self.creator.clone()));
                state.document = Some(Arc::clone(&document));
                state.page_count = 0;
                document
            }
        };
        let page = match &state.current_page {
            Some(page) => page.id.clone(),
            None => state.start_page(None, None),
        };
        document.add_entry(build(&page))
    }
}

pub(crate) fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
