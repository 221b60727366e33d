pub mod canonical;
pub mod config;
pub mod csv_codec;
pub mod debounce;
pub mod deduplication;
pub mod error;
pub mod export;
pub mod kv;
pub mod markup;
pub mod ranking;
pub mod scanner;
pub mod session;
pub mod store;
pub mod types;
pub mod worker;

// Re-export for tests
pub use scanner::ExtractionScanner;
pub use store::AggregateStore;
