// 🌐 Rate-Limited Fetcher - Paginated fetch with retry + backoff
// Knows nothing about the canonical schema: it yields raw page captures.
// Failure after exhausted retries ends the sequence early; pages already
// yielded stay valid. A genuinely empty page is a clean end, never an error.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::schema::DateWindow;
use crate::sources::{parse_page, SourceConfig, SourceId};

// ============================================================================
// FETCH CONFIG
// ============================================================================

/// Fetch tuning knobs, per source.
#[derive(Debug, Clone, Serialize)]
pub struct FetchConfig {
    /// Records requested per page
    pub page_size: usize,

    /// Hard bound on pages fetched in one run
    pub max_pages: usize,

    /// Sleep between successful pages (source rate limits)
    pub page_sleep_seconds: f64,

    /// Retries per page after the initial attempt
    pub max_retry_attempts: u32,

    /// Backoff delay is `backoff_base_seconds * 2^attempt`
    pub backoff_base_seconds: f64,

    /// Cap on any single backoff delay
    pub max_backoff_seconds: f64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            page_size: 100,
            max_pages: 50,
            page_sleep_seconds: 1.0,
            max_retry_attempts: 3,
            backoff_base_seconds: 1.0,
            max_backoff_seconds: 60.0,
        }
    }
}

impl FetchConfig {
    /// Delay before retrying after failed attempt `attempt` (1-based):
    /// exponential, capped at `max_backoff_seconds`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let secs = self.backoff_base_seconds * 2f64.powi(attempt as i32);
        Duration::from_secs_f64(secs.min(self.max_backoff_seconds))
    }

    pub fn page_sleep(&self) -> Duration {
        Duration::from_secs_f64(self.page_sleep_seconds)
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// One failed transport request. Transient failures are retried;
/// everything else fails the page immediately.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("http status {status}")]
    Http { status: u16 },

    #[error("rate limited by source")]
    RateLimited,

    #[error("malformed page body: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Network failures, 5xx and explicit rate-limit signals are worth
    /// retrying; 4xx and malformed bodies are not.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::RateLimited => true,
            TransportError::Http { status } => *status >= 500,
            TransportError::Malformed(_) => false,
        }
    }
}

/// Source-level fetch failure: aborts the remaining pages for this source
/// only. Distinct from clean end-of-results.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("page {page} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        page: usize,
        attempts: u32,
        source: TransportError,
    },

    #[error("page {page} request failed: {source}")]
    Request { page: usize, source: TransportError },
}

// ============================================================================
// SEAMS: TRANSPORT + SLEEP
// ============================================================================

/// What one transport request produced: the raw body plus just enough
/// pagination signal to drive the loop.
#[derive(Debug, Clone)]
pub struct TransportPage {
    pub body: String,

    /// Number of records in the page (0 means clean end-of-results)
    pub record_count: usize,

    /// Explicit continuation flag when the source provides one
    pub has_next: Option<bool>,
}

/// Transport seam. The production impl speaks HTTP; tests inject fakes.
pub trait PageTransport {
    fn request_page(
        &self,
        config: &SourceConfig,
        window: &DateWindow,
        page: usize,
    ) -> Result<TransportPage, TransportError>;
}

/// Sleep seam so tests record delays instead of waiting them out.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Real sleeping for production use.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

// ============================================================================
// RAW PAGE
// ============================================================================

/// Immutable capture of one fetched page, exactly as received.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub source: SourceId,

    /// 1-based page index within this fetch sequence
    pub page_index: usize,

    pub body: String,

    /// SHA-256 of the body, for replay/audit comparison
    pub content_hash: String,

    pub received_at: DateTime<Utc>,
}

fn content_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// PAGE FETCHER
// ============================================================================

/// Lazy, finite, non-restartable page sequence for one source.
/// Pages are strictly sequential because pagination cursors are stateful.
pub struct PageFetcher<'a, T: PageTransport, S: Sleeper> {
    transport: &'a T,
    sleeper: &'a S,
    config: &'a SourceConfig,
    window: DateWindow,
    next_page: usize,
    emitted: usize,
    done: bool,
}

impl<'a, T: PageTransport, S: Sleeper> PageFetcher<'a, T, S> {
    pub fn new(
        transport: &'a T,
        sleeper: &'a S,
        config: &'a SourceConfig,
        window: DateWindow,
    ) -> Self {
        PageFetcher {
            transport,
            sleeper,
            config,
            window,
            next_page: 1,
            emitted: 0,
            done: false,
        }
    }

    /// One page with retry/backoff. Attempts are 1-based; after failed
    /// attempt `a` we sleep `backoff_base_seconds * 2^a` (capped).
    fn fetch_with_retry(&self, page: usize) -> Result<TransportPage, FetchError> {
        let fetch = &self.config.fetch;
        let total_attempts = fetch.max_retry_attempts + 1;

        let mut attempt = 1u32;
        loop {
            match self.transport.request_page(self.config, &self.window, page) {
                Ok(body) => return Ok(body),
                Err(e) if e.is_transient() && attempt < total_attempts => {
                    let delay = fetch.backoff_delay(attempt);
                    tracing::warn!(
                        source = self.config.id.as_str(),
                        page,
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "transient fetch failure, backing off"
                    );
                    self.sleeper.sleep(delay);
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(FetchError::RetriesExhausted {
                        page,
                        attempts: total_attempts,
                        source: e,
                    })
                }
                Err(e) => return Err(FetchError::Request { page, source: e }),
            }
        }
    }
}

impl<'a, T: PageTransport, S: Sleeper> Iterator for PageFetcher<'a, T, S> {
    type Item = Result<RawPage, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.emitted >= self.config.fetch.max_pages {
            self.done = true;
            return None;
        }

        // Inter-page politeness delay (never before the first page)
        if self.emitted > 0 {
            self.sleeper.sleep(self.config.fetch.page_sleep());
        }

        let page = self.next_page;
        match self.fetch_with_retry(page) {
            Ok(transport_page) => {
                if transport_page.record_count == 0 {
                    // Clean end-of-results, not a failure; the empty
                    // envelope is not yielded and not archived
                    self.done = true;
                    return None;
                }
                if transport_page.has_next == Some(false) {
                    self.done = true;
                }
                self.next_page += 1;
                self.emitted += 1;
                Some(Ok(RawPage {
                    source: self.config.id,
                    page_index: page,
                    content_hash: content_hash(&transport_page.body),
                    body: transport_page.body,
                    received_at: Utc::now(),
                }))
            }
            Err(e) => {
                // Terminates this source's sequence; earlier pages stay valid
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ============================================================================
// HTTP TRANSPORT
// ============================================================================

/// Production transport: blocking HTTP, one request shape per source.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("funding-harvester/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(HttpTransport { client })
    }

    fn send(
        &self,
        config: &SourceConfig,
        window: &DateWindow,
        page: usize,
    ) -> Result<reqwest::blocking::Response, reqwest::Error> {
        let start = window.start.to_string();
        let end = window.end.to_string();
        let page_size = config.fetch.page_size;

        match config.id {
            SourceId::UsaSpending => self
                .client
                .post(&config.endpoint)
                .json(&json!({
                    "filters": {
                        "time_period": [{"start_date": start, "end_date": end}],
                        "award_type_codes": ["A", "B", "C", "D", "02", "03", "04", "05"]
                    },
                    "fields": [
                        "Award ID", "Recipient Name", "Award Amount", "Action Date",
                        "Award Type", "Recipient UEI", "Recipient DUNS",
                        "NAICS Code", "Recipient Country"
                    ],
                    "page": page,
                    "limit": page_size
                }))
                .send(),
            SourceId::Sec => self
                .client
                .get(&config.endpoint)
                .query(&[
                    ("form_type", "D".to_string()),
                    ("date_from", start),
                    ("date_to", end),
                    ("page", page.to_string()),
                ])
                .send(),
            SourceId::Sbir => self
                .client
                .get(&config.endpoint)
                .query(&[
                    ("start_date", start),
                    ("end_date", end),
                    ("rows", page_size.to_string()),
                    ("start", ((page - 1) * page_size).to_string()),
                ])
                .send(),
        }
    }
}

impl PageTransport for HttpTransport {
    fn request_page(
        &self,
        config: &SourceConfig,
        window: &DateWindow,
        page: usize,
    ) -> Result<TransportPage, TransportError> {
        let response = self
            .send(config, window, page)
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(TransportError::RateLimited);
        }
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        // Validate the envelope here so the fetch loop can trust the counts
        let parsed = parse_page(config.id, &body)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;

        Ok(TransportPage {
            record_count: parsed.records.len(),
            has_next: parsed.has_next,
            body,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use chrono::NaiveDate;

    /// Scripted transport: pops one canned response per request.
    struct ScriptedTransport {
        responses: RefCell<VecDeque<Result<TransportPage, TransportError>>>,
        requests_seen: RefCell<Vec<usize>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<TransportPage, TransportError>>) -> Self {
            ScriptedTransport {
                responses: RefCell::new(responses.into()),
                requests_seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl PageTransport for ScriptedTransport {
        fn request_page(
            &self,
            _config: &SourceConfig,
            _window: &DateWindow,
            page: usize,
        ) -> Result<TransportPage, TransportError> {
            self.requests_seen.borrow_mut().push(page);
            self.responses
                .borrow_mut()
                .pop_front()
                .expect("transport script exhausted")
        }
    }

    /// Records requested delays instead of sleeping.
    struct RecordingSleeper {
        slept: RefCell<Vec<Duration>>,
    }

    impl RecordingSleeper {
        fn new() -> Self {
            RecordingSleeper {
                slept: RefCell::new(Vec::new()),
            }
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.slept.borrow_mut().push(duration);
        }
    }

    fn test_config() -> SourceConfig {
        let mut config = SourceConfig::defaults(crate::sources::SourceId::UsaSpending);
        config.fetch = FetchConfig {
            page_size: 10,
            max_pages: 5,
            page_sleep_seconds: 0.5,
            max_retry_attempts: 3,
            backoff_base_seconds: 1.0,
            max_backoff_seconds: 60.0,
        };
        config
    }

    fn test_window() -> DateWindow {
        DateWindow::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        )
    }

    fn page(records: usize, has_next: Option<bool>) -> Result<TransportPage, TransportError> {
        Ok(TransportPage {
            body: format!("{{\"results\": [], \"fake_records\": {records}}}"),
            record_count: records,
            has_next,
        })
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let config = FetchConfig {
            backoff_base_seconds: 1.0,
            max_backoff_seconds: 5.0,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(4));
        // 2^3 = 8 exceeds the cap
        assert_eq!(config.backoff_delay(3), Duration::from_secs(5));
    }

    #[test]
    fn test_transient_failures_retry_then_succeed() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Network("connection reset".into())),
            Err(TransportError::Http { status: 503 }),
            page(2, Some(false)),
        ]);
        let sleeper = RecordingSleeper::new();
        let config = test_config();

        let results: Vec<_> =
            PageFetcher::new(&transport, &sleeper, &config, test_window()).collect();

        // Exactly one page, no duplicate emission
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
        assert_eq!(transport.requests_seen.borrow().as_slice(), &[1, 1, 1]);

        // Backoff before attempt 2 is base*2, before attempt 3 is base*4
        let slept = sleeper.slept.borrow();
        assert_eq!(slept.len(), 2);
        assert_eq!(slept[0], Duration::from_secs(2));
        assert!(slept[1] >= Duration::from_secs(4));
    }

    #[test]
    fn test_retries_exhausted_is_a_fetch_error_not_clean_end() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Network("down".into())),
            Err(TransportError::Network("down".into())),
            Err(TransportError::Network("down".into())),
            Err(TransportError::Network("down".into())),
        ]);
        let sleeper = RecordingSleeper::new();
        let config = test_config();

        let mut fetcher = PageFetcher::new(&transport, &sleeper, &config, test_window());
        match fetcher.next() {
            Some(Err(FetchError::RetriesExhausted { page, attempts, .. })) => {
                assert_eq!(page, 1);
                assert_eq!(attempts, 4);
            }
            other => panic!("expected retries-exhausted error, got {other:?}"),
        }
        // Sequence is over after a page failure
        assert!(fetcher.next().is_none());
    }

    #[test]
    fn test_earlier_pages_stay_valid_when_a_later_page_fails() {
        let transport = ScriptedTransport::new(vec![
            page(3, Some(true)),
            Err(TransportError::Http { status: 500 }),
            Err(TransportError::Http { status: 500 }),
            Err(TransportError::Http { status: 500 }),
            Err(TransportError::Http { status: 500 }),
        ]);
        let sleeper = RecordingSleeper::new();
        let config = test_config();

        let results: Vec<_> =
            PageFetcher::new(&transport, &sleeper, &config, test_window()).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(FetchError::RetriesExhausted { .. })));
    }

    #[test]
    fn test_empty_page_is_clean_completion() {
        let transport = ScriptedTransport::new(vec![page(0, None)]);
        let sleeper = RecordingSleeper::new();
        let config = test_config();

        let results: Vec<_> =
            PageFetcher::new(&transport, &sleeper, &config, test_window()).collect();
        assert!(results.is_empty());
    }

    #[test]
    fn test_has_next_false_stops_after_yielding() {
        let transport = ScriptedTransport::new(vec![page(5, Some(true)), page(5, Some(false))]);
        let sleeper = RecordingSleeper::new();
        let config = test_config();

        let results: Vec<_> =
            PageFetcher::new(&transport, &sleeper, &config, test_window()).collect();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));

        // Inter-page sleep happened exactly once, between the two pages
        let slept = sleeper.slept.borrow();
        assert_eq!(slept.as_slice(), &[Duration::from_secs_f64(0.5)]);
    }

    #[test]
    fn test_max_pages_bounds_the_sequence() {
        let transport = ScriptedTransport::new(vec![
            page(1, Some(true)),
            page(1, Some(true)),
            page(1, Some(true)),
            page(1, Some(true)),
            page(1, Some(true)),
            page(1, Some(true)),
        ]);
        let sleeper = RecordingSleeper::new();
        let config = test_config();

        let results: Vec<_> =
            PageFetcher::new(&transport, &sleeper, &config, test_window()).collect();
        assert_eq!(results.len(), config.fetch.max_pages);
    }

    #[test]
    fn test_non_transient_failure_does_not_retry() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Http { status: 400 })]);
        let sleeper = RecordingSleeper::new();
        let config = test_config();

        let results: Vec<_> =
            PageFetcher::new(&transport, &sleeper, &config, test_window()).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(FetchError::Request { .. })));
        assert!(sleeper.slept.borrow().is_empty());
    }

    #[test]
    fn test_rate_limit_is_transient() {
        assert!(TransportError::RateLimited.is_transient());
        assert!(TransportError::Http { status: 502 }.is_transient());
        assert!(!TransportError::Http { status: 404 }.is_transient());
        assert!(!TransportError::Malformed("bad json".into()).is_transient());
    }

    #[test]
    fn test_raw_page_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
    }
}
