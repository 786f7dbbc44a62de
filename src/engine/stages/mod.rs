//! The four standard stage runners.

mod crawl;
mod fuzz;
mod summarize;
mod threat_model;

pub use crawl::CrawlStage;
pub use fuzz::FuzzStage;
pub use summarize::SummarizeStage;
pub use threat_model::ThreatModelStage;

/// Tool the crawl stage fetches pages with.
pub const FETCH_TOOL: &str = "fetch_page";
