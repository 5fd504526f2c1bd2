use std::collections::BTreeSet;
use std::sync::Arc;

use gleaner_core::error::AppError;
use gleaner_core::models::{Category, Record};
use gleaner_core::task::Task;
use gleaner_core::traits::{Extractor, ExtractorFactory, Fetcher};

use crate::feed::{FeedExtractor, FeedSelectors};
use crate::listing::{CompiledSelectors, HtmlListingExtractor, ListingSelectors};

/// The extractor a worker gets for a given category.
#[derive(Clone)]
pub enum CategoryExtractor<F: Fetcher> {
    Listing(HtmlListingExtractor<F>),
    Feed(FeedExtractor<F>),
}

impl<F: Fetcher> Extractor for CategoryExtractor<F> {
    async fn extract(&self, url: &str, task: &Task) -> Result<Vec<Record>, AppError> {
        match self {
            CategoryExtractor::Listing(extractor) => extractor.extract(url, task).await,
            CategoryExtractor::Feed(extractor) => extractor.extract(url, task).await,
        }
    }
}

/// Category-keyed registry of HTTP extractors sharing one fetcher.
///
/// Selectors are compiled once here; every extractor it creates shares them.
#[derive(Clone)]
pub struct HttpExtractorFactory<F: Fetcher> {
    fetcher: F,
    enabled: BTreeSet<Category>,
    news: Arc<CompiledSelectors>,
    blog: Arc<CompiledSelectors>,
    feed: Arc<FeedSelectors>,
}

impl<F: Fetcher> HttpExtractorFactory<F> {
    pub fn new(fetcher: F) -> Result<Self, AppError> {
        Self::with_selectors(fetcher, ListingSelectors::news(), ListingSelectors::blog())
    }

    pub fn with_selectors(
        fetcher: F,
        news: ListingSelectors,
        blog: ListingSelectors,
    ) -> Result<Self, AppError> {
        Ok(Self {
            fetcher,
            enabled: Category::ALL.into_iter().collect(),
            news: Arc::new(news.compile()?),
            blog: Arc::new(blog.compile()?),
            feed: Arc::new(FeedSelectors::new()?),
        })
    }

    /// Restrict the registry to `categories`; tasks in any other category
    /// fail as unsupported.
    pub fn only(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.enabled = categories.into_iter().collect();
        self
    }
}

impl<F: Fetcher + 'static> ExtractorFactory for HttpExtractorFactory<F> {
    type Extractor = CategoryExtractor<F>;

    fn supports(&self, category: Category) -> bool {
        self.enabled.contains(&category)
    }

    fn create(&self, category: Category) -> Result<CategoryExtractor<F>, AppError> {
        if !self.supports(category) {
            return Err(AppError::UnsupportedCategory(category.to_string()));
        }
        let fetcher = self.fetcher.clone();
        Ok(match category {
            Category::News => CategoryExtractor::Listing(HtmlListingExtractor::new(
                fetcher,
                Category::News,
                self.news.clone(),
            )),
            Category::Blog => CategoryExtractor::Listing(HtmlListingExtractor::new(
                fetcher,
                Category::Blog,
                self.blog.clone(),
            )),
            Category::Rss => CategoryExtractor::Feed(FeedExtractor::new(fetcher, self.feed.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::StaticFetcher;

    #[test]
    fn every_category_is_supported_by_default() {
        let factory = HttpExtractorFactory::new(StaticFetcher::default()).unwrap();
        for category in Category::ALL {
            assert!(factory.supports(category));
            assert!(factory.create(category).is_ok());
        }
    }

    #[test]
    fn create_picks_the_variant_for_the_category() {
        let factory = HttpExtractorFactory::new(StaticFetcher::default()).unwrap();
        assert!(matches!(factory.create(Category::Rss), Ok(CategoryExtractor::Feed(_))));
        assert!(matches!(factory.create(Category::News), Ok(CategoryExtractor::Listing(_))));
        assert!(matches!(factory.create(Category::Blog), Ok(CategoryExtractor::Listing(_))));
    }

    #[test]
    fn restricted_factory_rejects_other_categories() {
        let factory = HttpExtractorFactory::new(StaticFetcher::default())
            .unwrap()
            .only([Category::News]);

        assert!(factory.supports(Category::News));
        assert!(!factory.supports(Category::Blog));
        let err = factory.create(Category::Blog).err().unwrap();
        assert!(matches!(err, AppError::UnsupportedCategory(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn dispatches_to_the_feed_parser() {
        let url = "https://feeds.example.com/rss";
        let body = "<rss><channel><item><title>Rust 2024</title>\
                    <link>https://feeds.example.com/rust</link></item></channel></rss>";
        let factory = HttpExtractorFactory::new(StaticFetcher::with_page(url, body)).unwrap();
        let task = Task::new(1, url, Category::Rss).with_search_term("rust");

        let extractor = factory.create(Category::Rss).unwrap();
        let records = extractor.extract(url, &task).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, "https://feeds.example.com/rust");
    }
}
