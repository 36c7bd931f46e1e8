// Funding Harvester - Core Library
// Exposes all modules for use in the CLI and tests

pub mod schema;
pub mod sources;
pub mod mapper;
pub mod fetcher;
pub mod resolver;
pub mod store;
pub mod pipeline;

// Re-export commonly used types
pub use schema::{
    CanonicalFundingEvent, DateWindow, FundingType, Identifier, IdentifierKind,
    normalize_company_name, parse_amount, parse_event_date,
};
pub use sources::{
    ParsedPage, SourceConfig, SourceId, SourceRecord,
    parse_page,
};
pub use mapper::{MappingError, map_record};
pub use fetcher::{
    FetchConfig, FetchError, HttpTransport, PageFetcher, PageTransport,
    RawPage, Sleeper, ThreadSleeper, TransportError, TransportPage,
};
pub use resolver::{
    CompanyEntity, EntityRegistry, EventRef, LevenshteinSimilarity,
    NameSimilarity, Resolution, ResolutionConflict,
};
pub use store::{
    IngestRun, RunCounts, RunStatus, Store, StoreError, StoredEvent,
};
pub use pipeline::{Pipeline, RunSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
