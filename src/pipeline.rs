use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::config::Pacing;
use crate::db::{self, DeadLetterKind};
use crate::detail::DetailFetcher;
use crate::listing::Paginator;
use crate::model::CompanyRecord;
use crate::store::{FlushOutcome, IngestionStore, TableStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    FetchingPage,
    FetchingDetails,
    Batching,
    Flushing,
    Completed,
}

/// End-of-run tally.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub start_page: u32,
    pub last_page: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pages_processed: usize,
    pub failed_pages: Vec<u32>,
    pub companies_seen: usize,
    pub detail_failures: usize,
    pub missing_description: usize,
    pub missing_location: usize,
    pub inserted: usize,
    pub skipped_existing: usize,
    pub failed_inserts: usize,
    pub recovered_inserts: usize,
    pub discarded_letters: usize,
    pub flush_sizes: Vec<usize>,
}

impl RunReport {
    fn new(start_page: u32, last_page: u32) -> Self {
        RunReport {
            start_page,
            last_page,
            started_at: Utc::now(),
            finished_at: None,
            pages_processed: 0,
            failed_pages: Vec::new(),
            companies_seen: 0,
            detail_failures: 0,
            missing_description: 0,
            missing_location: 0,
            inserted: 0,
            skipped_existing: 0,
            failed_inserts: 0,
            recovered_inserts: 0,
            discarded_letters: 0,
            flush_sizes: Vec::new(),
        }
    }

    fn absorb(&mut self, outcome: &FlushOutcome) {
        self.inserted += outcome.inserted;
        self.skipped_existing += outcome.skipped_existing;
        self.failed_inserts += outcome.failed.len();
    }

    pub fn print(&self) {
        let finished = self.finished_at.unwrap_or_else(Utc::now);
        let secs = (finished - self.started_at).num_seconds();
        println!("Page range:          {}-{} ({}s)", self.start_page, self.last_page, secs);
        println!("Pages processed:     {}", self.pages_processed);
        println!("Pages failed:        {} {:?}", self.failed_pages.len(), self.failed_pages);
        println!("Companies seen:      {}", self.companies_seen);
        println!("Detail failures:     {}", self.detail_failures);
        println!("Missing industry:    {}", self.missing_description);
        println!("Missing location:    {}", self.missing_location);
        println!("Inserted:            {}", self.inserted);
        println!("Already present:     {}", self.skipped_existing);
        println!("Failed inserts:      {}", self.failed_inserts);
        if self.recovered_inserts > 0 {
            println!("Recovered inserts:   {}", self.recovered_inserts);
        }
        if self.discarded_letters > 0 {
            println!("Discarded letters:   {}", self.discarded_letters);
        }
    }
}

/// Sequential driver: pages, then details, then batched inserts.
pub struct Pipeline<S> {
    paginator: Paginator,
    details: DetailFetcher,
    store: IngestionStore<S>,
    pacing: Pacing,
    last_page: u32,
    state_db: Option<Connection>,
    progress: ProgressBar,
    state: PipelineState,
    buffer: Vec<CompanyRecord>,
    checkpointed: Option<u32>,
    checkpointing: bool,
    report: RunReport,
}

impl<S: TableStore> Pipeline<S> {
    pub fn new(
        paginator: Paginator,
        details: DetailFetcher,
        store: IngestionStore<S>,
        pacing: Pacing,
        last_page: u32,
    ) -> Self {
        Pipeline {
            paginator,
            details,
            store,
            pacing,
            last_page,
            state_db: None,
            progress: ProgressBar::hidden(),
            state: PipelineState::Idle,
            buffer: Vec::new(),
            checkpointed: None,
            checkpointing: true,
            report: RunReport::new(1, last_page),
        }
    }

    /// Checkpoints and dead letters go to this database.
    pub fn with_state_db(mut self, conn: Connection) -> Self {
        self.state_db = Some(conn);
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    #[cfg(test)]
    pub fn state_db(&self) -> Option<&Connection> {
        self.state_db.as_ref()
    }

    fn set_state(&mut self, next: PipelineState) {
        if self.state != next {
            debug!("{:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Harvest `start_page..=last_page`. Pages before `start_page` are never requested.
    pub async fn run(&mut self, start_page: u32) -> RunReport {
        let start_page = start_page.max(1);
        self.report = RunReport::new(start_page, self.last_page);
        self.checkpointing = true;
        self.checkpointed = None;

        if start_page > self.last_page {
            info!("Start page {} is past the last page {}", start_page, self.last_page);
        } else {
            info!("Resuming scraping from page {}/{}", start_page, self.last_page);
            self.progress.set_length(u64::from(self.last_page - start_page + 1));
        }

        for page in start_page..=self.last_page {
            self.process_page(page).await;
            self.progress.inc(1);
            if page < self.last_page {
                tokio::time::sleep(self.pacing.page_delay).await;
            }
        }

        self.finish().await
    }

    /// Re-run dead-lettered pages and inserts from earlier runs.
    pub async fn retry_dead_letters(&mut self) -> anyhow::Result<RunReport> {
        self.report = RunReport::new(1, self.last_page);
        self.checkpointing = false;

        let Some(conn) = self.state_db.as_ref() else {
            return Ok(self.finish().await);
        };
        let pages = db::fetch_dead_letters(conn, DeadLetterKind::Page)?;
        let inserts = db::fetch_dead_letters(conn, DeadLetterKind::Insert)?;
        info!(
            "Retrying {} failed pages and {} failed inserts",
            pages.len(),
            inserts.len()
        );
        self.progress.set_length((pages.len() + inserts.len()) as u64);

        for (i, letter) in pages.iter().enumerate() {
            let Some(page) = letter.page else {
                warn!("Dead letter {} names no page, discarding", letter.id);
                self.discard(letter.id)?;
                continue;
            };
            debug!("Retrying page {} (failed with: {})", page, letter.error);
            // A failed attempt has already recorded its own letter by now.
            self.process_page(page).await;
            if let Some(conn) = self.state_db.as_ref() {
                db::resolve_dead_letter(conn, letter.id)?;
            }
            self.progress.inc(1);
            if i + 1 < pages.len() {
                tokio::time::sleep(self.pacing.page_delay).await;
            }
        }

        for letter in &inserts {
            self.progress.inc(1);
            let Some(payload) = letter.payload.as_deref() else {
                warn!("Dead letter {} for {:?} has no payload, discarding", letter.id, letter.name);
                self.discard(letter.id)?;
                continue;
            };
            debug!(
                "Retrying insert of {:?} from {:?} (failed with: {})",
                letter.name, letter.source_url, letter.error
            );
            let record: CompanyRecord = match serde_json::from_str(payload) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Unreadable dead letter {}: {}, discarding", letter.id, e);
                    self.discard(letter.id)?;
                    continue;
                }
            };
            match self.store.insert_if_absent(&record).await {
                Ok(inserted) => {
                    if inserted {
                        self.report.recovered_inserts += 1;
                    }
                    if let Some(conn) = self.state_db.as_ref() {
                        db::resolve_dead_letter(conn, letter.id)?;
                    }
                }
                Err(e) => warn!("Error saving company '{}': {}", record.name, e),
            }
        }

        Ok(self.finish().await)
    }

    fn discard(&mut self, id: i64) -> anyhow::Result<()> {
        self.report.discarded_letters += 1;
        match self.state_db.as_ref() {
            Some(conn) => db::resolve_dead_letter(conn, id),
            None => Ok(()),
        }
    }

    async fn process_page(&mut self, page: u32) {
        self.set_state(PipelineState::FetchingPage);
        info!("Scraping page {}/{}...", page, self.last_page);
        self.progress.set_message(format!("page {}", page));

        let stubs = match self.paginator.fetch_page(page).await {
            Ok(stubs) => stubs,
            Err(e) => {
                warn!("Error fetching page {}: {}", page, e);
                self.report.failed_pages.push(page);
                if let Some(conn) = self.state_db.as_ref() {
                    if let Err(db_err) = db::record_failed_page(conn, page, &e.to_string()) {
                        warn!("Could not record failed page {}: {}", page, db_err);
                    }
                }
                return;
            }
        };
        self.report.pages_processed += 1;
        debug!("Page {} listed {} companies", page, stubs.len());

        self.set_state(PipelineState::FetchingDetails);
        for (i, stub) in stubs.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.pacing.detail_delay).await;
            }
            debug!("Getting details for {}...", stub.name);

            let fields = match self.details.try_fetch_details(&stub.source_url).await {
                Ok(fields) => fields,
                Err(e) => {
                    warn!("Error fetching company details for '{}': {}", stub.name, e);
                    self.report.detail_failures += 1;
                    Default::default()
                }
            };
            if fields.description.is_none() {
                self.report.missing_description += 1;
            }
            if fields.location.is_none() {
                self.report.missing_location += 1;
            }
            self.report.companies_seen += 1;
            self.buffer.push(CompanyRecord::from_stub(stub, fields));

            if self.buffer.len() >= self.pacing.batch_size {
                self.set_state(PipelineState::Batching);
                self.flush().await;
                // Everything before this page is now stored.
                if page > 1 {
                    self.checkpoint(page - 1);
                }
                self.set_state(PipelineState::FetchingDetails);
            }
        }

        if self.buffer.is_empty() {
            self.checkpoint(page);
        }
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        self.set_state(PipelineState::Flushing);
        let batch = std::mem::take(&mut self.buffer);
        let outcome = self.store.flush_batch(&batch).await;

        self.report.flush_sizes.push(batch.len());
        self.report.absorb(&outcome);

        if let Some(conn) = self.state_db.as_ref() {
            for failed in &outcome.failed {
                let payload = match serde_json::to_string(&failed.record) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Could not serialize '{}': {}", failed.record.name, e);
                        continue;
                    }
                };
                if let Err(e) = db::record_failed_insert(
                    conn,
                    &failed.record.name,
                    &failed.record.source_url,
                    &payload,
                    &failed.error,
                ) {
                    warn!("Could not record failed insert '{}': {}", failed.record.name, e);
                }
            }
        }
    }

    fn checkpoint(&mut self, page: u32) {
        if !self.checkpointing || self.checkpointed.is_some_and(|done| done >= page) {
            return;
        }
        if let Some(conn) = self.state_db.as_ref() {
            match db::save_checkpoint(conn, db::LISTING_RUN_KEY, page) {
                Ok(()) => debug!("Checkpoint at page {}", page),
                Err(e) => {
                    warn!("Could not save checkpoint at page {}: {}", page, e);
                    return;
                }
            }
        }
        self.checkpointed = Some(page);
    }

    async fn finish(&mut self) -> RunReport {
        if !self.buffer.is_empty() {
            self.set_state(PipelineState::Batching);
            self.flush().await;
        }
        if self.report.start_page <= self.last_page {
            self.checkpoint(self.last_page);
        }
        self.set_state(PipelineState::Completed);
        self.progress.finish_and_clear();
        self.report.finished_at = Some(Utc::now());
        info!(
            "Scraping completed: {} pages processed, {} inserted",
            self.report.pages_processed, self.report.inserted
        );
        self.report.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::fetch::HttpFetcher;
    use crate::store::{Filter, LocalStore};
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn listing(first_id: usize, count: usize) -> String {
        let links: String = (first_id..first_id + count)
            .map(|id| {
                format!(
                    r#"<li><a href="/2026/company/r{id}/">会社{id}</a><a href="/2026/company/r{id}/entries/">エントリー</a></li>"#
                )
            })
            .collect();
        format!("<html><body><a href=\"/2026/s/\">企業検索</a><ul>{}</ul></body></html>", links)
    }

    async fn mount_listing(server: &MockServer, page: u32, body: String) {
        Mock::given(method("GET"))
            .and(path("/2026/s/"))
            .and(query_param("pn", page.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    async fn mount_details(server: &MockServer) {
        let html = std::fs::read_to_string("tests/fixtures/detail.html").unwrap();
        Mock::given(method("GET"))
            .and(path_regex(r"^/2026/company/r\d+/$"))
            .respond_with(ResponseTemplate::new(200).set_body_string(html))
            .mount(server)
            .await;
    }

    fn pipeline(server: &MockServer, total_records: u32) -> Pipeline<LocalStore> {
        let settings = Settings {
            listing_url: format!("{}/2026/s/", server.uri()),
            total_records,
            page_size: 100,
            detail_delay_ms: 0,
            page_delay_ms: 0,
            max_retries: 0,
            ..Settings::default()
        };
        let fetcher = HttpFetcher::new(&settings).unwrap();
        let state = Connection::open_in_memory().unwrap();
        db::init_schema(&state).unwrap();

        Pipeline::new(
            Paginator::new(fetcher.clone(), &settings),
            DetailFetcher::new(fetcher),
            IngestionStore::new(LocalStore::in_memory().unwrap()),
            settings.pacing(),
            settings.last_page(),
        )
        .with_state_db(state)
    }

    fn requested_pages(requests: &[wiremock::Request]) -> Vec<u32> {
        requests
            .iter()
            .filter_map(|r| {
                r.url
                    .query_pairs()
                    .find(|(k, _)| k == "pn")
                    .and_then(|(_, v)| v.parse().ok())
            })
            .collect()
    }

    #[tokio::test]
    async fn flushes_full_batches_then_the_remainder() {
        let server = MockServer::start().await;
        mount_listing(&server, 1, listing(1, 25)).await;
        mount_listing(&server, 2, listing(26, 20)).await;
        mount_details(&server).await;

        let mut p = pipeline(&server, 200);
        let report = p.run(1).await;

        assert_eq!(report.flush_sizes, vec![20, 20, 5]);
        assert_eq!(report.companies_seen, 45);
        assert_eq!(report.inserted, 45);
        assert_eq!(report.missing_description, 0);
        assert_eq!(p.state(), PipelineState::Completed);

        let conn = p.state_db().unwrap();
        assert_eq!(db::load_checkpoint(conn, db::LISTING_RUN_KEY).unwrap(), Some(2));
    }

    #[tokio::test]
    async fn resume_never_requests_earlier_pages() {
        let server = MockServer::start().await;
        for page in 1..=5 {
            mount_listing(&server, page, listing(page as usize * 10, 2)).await;
        }
        mount_details(&server).await;

        let mut p = pipeline(&server, 500);
        let report = p.run(3).await;
        assert_eq!(report.pages_processed, 3);

        let requests = server.received_requests().await.unwrap();
        let pages = requested_pages(&requests);
        assert_eq!(pages, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn failed_page_is_skipped_and_dead_lettered() {
        let server = MockServer::start().await;
        mount_listing(&server, 1, listing(1, 2)).await;
        Mock::given(method("GET"))
            .and(path("/2026/s/"))
            .and(query_param("pn", "2"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        mount_listing(&server, 3, listing(3, 2)).await;
        mount_details(&server).await;

        let mut p = pipeline(&server, 300);
        let report = p.run(1).await;
        assert_eq!(report.failed_pages, vec![2]);
        assert_eq!(report.pages_processed, 2);
        assert_eq!(report.inserted, 4);

        let conn = p.state_db().unwrap();
        let letters = db::fetch_dead_letters(conn, DeadLetterKind::Page).unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].page, Some(2));

        // The site recovers; the retry pass picks the page up.
        server.reset().await;
        mount_listing(&server, 2, listing(100, 3)).await;
        mount_details(&server).await;

        let retry = p.retry_dead_letters().await.unwrap();
        assert_eq!(retry.inserted, 3);
        let conn = p.state_db().unwrap();
        assert!(db::fetch_dead_letters(conn, DeadLetterKind::Page).unwrap().is_empty());
    }

    #[tokio::test]
    async fn detail_failure_keeps_the_stub() {
        let server = MockServer::start().await;
        mount_listing(&server, 1, listing(1, 1)).await;
        Mock::given(method("GET"))
            .and(path("/2026/company/r1/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut p = pipeline(&server, 100);
        let report = p.run(1).await;
        assert_eq!(report.detail_failures, 1);
        assert_eq!(report.missing_location, 1);
        assert_eq!(report.inserted, 1);

        let rows = p
            .store
            .table()
            .select(&Filter::NameEq("会社1".into()), None)
            .await
            .unwrap();
        assert_eq!(rows[0].description, None);
        assert_eq!(rows[0].source_url, format!("{}/2026/company/r1/", server.uri()));
    }

    #[tokio::test]
    async fn rerun_inserts_nothing_new() {
        let server = MockServer::start().await;
        mount_listing(&server, 1, listing(1, 3)).await;
        mount_details(&server).await;

        let mut p = pipeline(&server, 100);
        assert_eq!(p.run(1).await.inserted, 3);
        let again = p.run(1).await;
        assert_eq!(again.inserted, 0);
        assert_eq!(again.skipped_existing, 3);
    }

    #[tokio::test]
    async fn page_still_failing_on_retry_keeps_one_letter() {
        let server = MockServer::start().await;
        mount_listing(&server, 1, listing(1, 2)).await;
        Mock::given(method("GET"))
            .and(path("/2026/s/"))
            .and(query_param("pn", "2"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        mount_details(&server).await;

        let mut p = pipeline(&server, 200);
        p.run(1).await;
        let conn = p.state_db().unwrap();
        let before = db::fetch_dead_letters(conn, DeadLetterKind::Page).unwrap();
        assert_eq!(before.len(), 1);

        let retry = p.retry_dead_letters().await.unwrap();
        assert_eq!(retry.failed_pages, vec![2]);

        let conn = p.state_db().unwrap();
        let after = db::fetch_dead_letters(conn, DeadLetterKind::Page).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].page, Some(2));
        assert_ne!(after[0].id, before[0].id);
    }

    #[tokio::test]
    async fn insert_letters_without_a_usable_payload_are_discarded() {
        let server = MockServer::start().await;
        let mut p = pipeline(&server, 100);
        let conn = p.state_db().unwrap();
        conn.execute(
            "INSERT INTO dead_letters (kind, name, error) VALUES ('insert', '会社X', 'timeout')",
            [],
        )
        .unwrap();
        db::record_failed_insert(conn, "会社Y", "https://example.com/r1/", "{not json", "timeout")
            .unwrap();
        db::record_failed_insert(
            conn,
            "会社Z",
            "https://example.com/r2/",
            r#"{"name":"会社Z","source_url":"https://example.com/r2/"}"#,
            "timeout",
        )
        .unwrap();

        let report = p.retry_dead_letters().await.unwrap();
        assert_eq!(report.discarded_letters, 2);
        assert_eq!(report.recovered_inserts, 1);

        let conn = p.state_db().unwrap();
        assert!(db::fetch_dead_letters(conn, DeadLetterKind::Insert).unwrap().is_empty());
    }
}
