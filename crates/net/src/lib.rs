#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Network and fetch tiers for the zipline loader
//!
//! A module is fetched through an ordered chain of sources: a read-only
//! embedded directory, the content-addressed cache, and finally the
//! network. Modules are looked up local-first because their hashes
//! guarantee equivalence; manifests are looked up network-first so that
//! freshness wins.

mod client;
mod fetcher;
mod limiter;

pub use client::{HttpClient, HttpConfig};
pub use fetcher::{EmbeddedFetcher, Fetcher, FetcherChain, FsCachingFetcher, HttpFetcher};
pub use limiter::{ConcurrencyLimiter, DEFAULT_CONCURRENT_DOWNLOADS};
