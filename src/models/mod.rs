//! Data models.

mod archive;
mod listing;
mod target;

pub use archive::{ArchiveEntry, ArtifactType};
pub use listing::{
    BuyerFee, BuyerFeeConfig, CandidateListing, DetailFields, ExtractionStrategy, ListingStatus,
};
pub use target::{RunParams, ScrapeTarget, DEFAULT_MAX_PAGES};
