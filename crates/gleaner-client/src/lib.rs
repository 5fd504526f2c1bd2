pub mod factory;
pub mod feed;
pub mod fetcher;
pub mod listing;

pub use factory::{CategoryExtractor, HttpExtractorFactory};
pub use feed::FeedExtractor;
pub use fetcher::ReqwestFetcher;
pub use listing::{HtmlListingExtractor, ListingSelectors};
