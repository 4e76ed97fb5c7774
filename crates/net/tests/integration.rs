//! Integration tests for net crate

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;
    use zipline_cache::{Cache, CacheConfig};
    use zipline_events::EventEmitter;
    use zipline_hash::Sha256Digest;
    use zipline_manifest::manifest_file_name;
    use zipline_net::{
        ConcurrencyLimiter, EmbeddedFetcher, Fetcher, FetcherChain, FsCachingFetcher, HttpClient,
        HttpFetcher, HttpConfig,
    };

    fn quick_client() -> HttpClient {
        HttpClient::new(HttpConfig {
            retry_count: 0,
            ..HttpConfig::default()
        })
        .unwrap()
    }

    fn manifest_json(module_url: &str, content: &[u8]) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "modules": {
                "./app.js": {
                    "url": module_url,
                    "sha256": Sha256Digest::digest(content).to_hex(),
                }
            },
            "mainModuleId": "./app.js",
        }))
        .unwrap()
    }

    async fn open_cache(dir: &std::path::Path) -> Arc<Cache> {
        Arc::new(
            Cache::open(CacheConfig::new(dir), EventEmitter::new())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_client_download() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/app.zipline");
            then.status(200).body(b"module bytes");
        });

        let client = quick_client();
        let bytes = client.download(&server.url("/app.zipline")).await.unwrap();

        mock.assert();
        assert_eq!(bytes, b"module bytes");
    }

    #[tokio::test]
    async fn test_client_surfaces_http_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/missing.zipline");
            then.status(404);
        });

        let client = quick_client();
        let err = client
            .download(&server.url("/missing.zipline"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let client = quick_client();

        assert_eq!(
            client
                .resolve("https://example.com/apps/manifest.zipline.json", "app.zipline")
                .unwrap(),
            "https://example.com/apps/app.zipline"
        );
        assert_eq!(
            client
                .resolve(
                    "https://example.com/apps/manifest.zipline.json",
                    "https://cdn.example.com/app.zipline"
                )
                .unwrap(),
            "https://cdn.example.com/app.zipline"
        );
        assert!(client.resolve("not a url", "app.zipline").is_err());
    }

    #[tokio::test]
    async fn test_embedded_fetcher_serves_by_hash() {
        let temp = tempdir().unwrap();
        let content = b"embedded module";
        let hash = Sha256Digest::digest(content);
        tokio::fs::write(temp.path().join(hash.to_hex()), content)
            .await
            .unwrap();

        let fetcher = EmbeddedFetcher::new(temp.path());
        let limiter = ConcurrencyLimiter::default();

        let found = fetcher
            .fetch(&limiter, "app", "./app.js", &hash, "ignored")
            .await
            .unwrap();
        assert_eq!(found, Some(content.to_vec()));

        let miss = fetcher
            .fetch(
                &limiter,
                "app",
                "./app.js",
                &Sha256Digest::digest(b"other"),
                "ignored",
            )
            .await
            .unwrap();
        assert_eq!(miss, None);
    }

    #[tokio::test]
    async fn test_embedded_fetcher_serves_manifest_by_app_name() {
        let temp = tempdir().unwrap();
        let bytes = manifest_json("app.zipline", b"content");
        tokio::fs::write(temp.path().join(manifest_file_name("trivia")), &bytes)
            .await
            .unwrap();

        let fetcher = EmbeddedFetcher::new(temp.path());
        let limiter = ConcurrencyLimiter::default();

        let (raw, manifest) = fetcher
            .fetch_manifest(&limiter, "trivia", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw, bytes);
        assert!(manifest.modules.contains_key("./app.js"));

        assert!(fetcher
            .fetch_manifest(&limiter, "unknown", None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_caching_fetcher_downloads_once() {
        let server = MockServer::start();
        let content = b"cached module";
        let hash = Sha256Digest::digest(content);
        let mock = server.mock(|when, then| {
            when.method(GET).path("/app.zipline");
            then.status(200).body(content);
        });

        let temp = tempdir().unwrap();
        let cache = open_cache(temp.path()).await;
        let fetcher = FsCachingFetcher::new(
            cache,
            HttpFetcher::new(quick_client(), EventEmitter::new()),
        );
        let limiter = ConcurrencyLimiter::default();
        let url = server.url("/app.zipline");

        for _ in 0..3 {
            let bytes = fetcher
                .fetch(&limiter, "app", "./app.js", &hash, &url)
                .await
                .unwrap();
            assert_eq!(bytes, Some(content.to_vec()));
        }

        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn test_chain_prefers_embedded_for_modules() {
        let server = MockServer::start();
        let content = b"module";
        let hash = Sha256Digest::digest(content);
        let mock = server.mock(|when, then| {
            when.method(GET).path("/app.zipline");
            then.status(200).body(content);
        });

        let embedded_dir = tempdir().unwrap();
        tokio::fs::write(embedded_dir.path().join(hash.to_hex()), content)
            .await
            .unwrap();
        let cache_dir = tempdir().unwrap();

        let chain = FetcherChain::new(vec![
            Arc::new(EmbeddedFetcher::new(embedded_dir.path())),
            Arc::new(FsCachingFetcher::new(
                open_cache(cache_dir.path()).await,
                HttpFetcher::new(quick_client(), EventEmitter::new()),
            )),
        ]);
        let limiter = ConcurrencyLimiter::default();

        let bytes = chain
            .fetch(
                &limiter,
                "app",
                "./app.js",
                &hash,
                &server.url("/app.zipline"),
            )
            .await
            .unwrap();
        assert_eq!(bytes, content.to_vec());

        // The network was never consulted.
        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn test_chain_fetches_manifest_network_first() {
        let server = MockServer::start();
        let fresh = manifest_json("fresh.zipline", b"fresh");
        let mock = server.mock(|when, then| {
            when.method(GET).path("/m.json");
            then.status(200).body(&fresh);
        });

        let embedded_dir = tempdir().unwrap();
        let stale = manifest_json("stale.zipline", b"stale");
        tokio::fs::write(
            embedded_dir.path().join(manifest_file_name("app")),
            &stale,
        )
        .await
        .unwrap();
        let cache_dir = tempdir().unwrap();

        let chain = FetcherChain::new(vec![
            Arc::new(EmbeddedFetcher::new(embedded_dir.path())),
            Arc::new(FsCachingFetcher::new(
                open_cache(cache_dir.path()).await,
                HttpFetcher::new(quick_client(), EventEmitter::new()),
            )),
        ]);
        let limiter = ConcurrencyLimiter::default();

        let (raw, _) = chain
            .fetch_manifest(&limiter, "app", Some(&server.url("/m.json")))
            .await
            .unwrap();
        assert_eq!(raw, fresh);
        mock.assert();
    }

    #[tokio::test]
    async fn test_chain_falls_back_to_embedded_when_network_fails() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/m.json");
            then.status(503);
        });

        let embedded_dir = tempdir().unwrap();
        let local = manifest_json("app.zipline", b"local");
        tokio::fs::write(
            embedded_dir.path().join(manifest_file_name("app")),
            &local,
        )
        .await
        .unwrap();
        let cache_dir = tempdir().unwrap();

        let chain = FetcherChain::new(vec![
            Arc::new(EmbeddedFetcher::new(embedded_dir.path())),
            Arc::new(FsCachingFetcher::new(
                open_cache(cache_dir.path()).await,
                HttpFetcher::new(quick_client(), EventEmitter::new()),
            )),
        ]);
        let limiter = ConcurrencyLimiter::default();

        let (raw, _) = chain
            .fetch_manifest(&limiter, "app", Some(&server.url("/m.json")))
            .await
            .unwrap();
        assert_eq!(raw, local);
    }

    #[tokio::test]
    async fn test_chain_without_url_serves_pinned_manifest() {
        let temp = tempdir().unwrap();
        let cache = open_cache(temp.path()).await;

        // Pin a manifest with no modules, as a previous load would have.
        let raw = serde_json::to_vec(&json!({ "mainModuleId": "./app.js" })).unwrap();
        let manifest = zipline_manifest::Manifest::parse(&raw).unwrap();
        let fetcher = FsCachingFetcher::new(
            cache,
            HttpFetcher::new(quick_client(), EventEmitter::new()),
        );
        fetcher.pin("app", &manifest, &raw).await.unwrap();

        let chain = FetcherChain::new(vec![Arc::new(fetcher)]);
        let limiter = ConcurrencyLimiter::default();

        let (found, _) = chain.fetch_manifest(&limiter, "app", None).await.unwrap();
        assert_eq!(found, raw);

        // A different application has nothing pinned.
        assert!(chain.fetch_manifest(&limiter, "other", None).await.is_err());
    }
}
