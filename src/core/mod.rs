//! Types and transport shared by every layer of the engine.

pub mod fetch;
pub mod normalize;
pub mod profile;
pub mod types;

pub use fetch::{FetchError, FetchRequest, FetchedPage, FetcherOptions, PageFetcher, ReqwestPageFetcher};
pub use normalize::{NormalizeError, NormalizedKey, normalize, normalize_url, parse_link};
pub use types::{
    AttemptRecord, AttemptVerdict, BypassResult, Diagnostics, LinkRequest, StrategyOutcome,
};
