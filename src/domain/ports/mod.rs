mod fetcher;

pub use fetcher::{FetchError, Fetcher};
