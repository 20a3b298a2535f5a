mod client;
mod http_source;
mod urls;

pub use client::{
    source_url_for, ApiConnector, ApiError, ApiSettings, HttpApiClient, HttpConnector, PackageApi,
    DEFAULT_TIMEOUT, DEFAULT_USER_AGENT,
};
pub use http_source::{is_remote_location, HttpSource, HttpSourceOpener};
pub use urls::{ApiEndpoints, SourceUrlParams};
