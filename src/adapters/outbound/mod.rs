mod ipapi_fetcher;

pub use ipapi_fetcher::{IpApiConfig, IpApiFetcher, IPAPI_FREE_URL, IPAPI_MAX_BATCH, IPAPI_PRO_URL};
