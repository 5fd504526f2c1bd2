mod common;
mod pipeline_tests;
mod record_store_tests;
