mod http_server;

pub use http_server::{
    router, BatchEntry, FieldsParam, HealthResponse, HttpLimits, HttpServer, HttpState,
    LookupParams,
};
