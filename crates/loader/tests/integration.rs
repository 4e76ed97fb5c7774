//! Integration tests for loader crate

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::StreamExt;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use zipline_cache::CacheConfig;
    use zipline_errors::Error;
    use zipline_events::{channel, Event, EventEmitter};
    use zipline_hash::Sha256Digest;
    use zipline_loader::{
        load_continuously, DownloadReceiver, LoadedApp, Loader, LoaderBuilder, Receiver,
    };
    use zipline_net::{HttpClient, HttpConfig};
    use zipline_signing::{ManifestSigner, ManifestVerifier};

    const SEED: &str = "4242424242424242424242424242424242424242424242424242424242424242";

    /// Records every received module, in hand-off order.
    #[derive(Debug)]
    struct CollectingReceiver {
        received: Vec<(String, Vec<u8>)>,
    }

    impl CollectingReceiver {
        fn new() -> Self {
            Self {
                received: Vec::new(),
            }
        }

        fn position(&self, id: &str) -> usize {
            self.received
                .iter()
                .position(|(received_id, _)| received_id == id)
                .unwrap_or_else(|| panic!("{id} was not received"))
        }
    }

    #[async_trait]
    impl Receiver for CollectingReceiver {
        async fn receive(
            &mut self,
            bytes: Vec<u8>,
            id: &str,
            _sha256: &Sha256Digest,
        ) -> Result<(), Error> {
            self.received.push((id.to_string(), bytes));
            Ok(())
        }
    }

    /// Builds a signed manifest whose modules point at the mock server.
    fn signed_manifest(
        server: &MockServer,
        signer: &ManifestSigner,
        modules: &[(&str, &[u8], &[&str])],
    ) -> Vec<u8> {
        let mut module_objects = serde_json::Map::new();
        for (id, content, deps) in modules {
            let mut object = serde_json::Map::new();
            object.insert(
                "url".to_string(),
                json!(server.url(format!("/{}.zipline", id.trim_start_matches("./")))),
            );
            object.insert(
                "sha256".to_string(),
                json!(Sha256Digest::digest(content).to_hex()),
            );
            if !deps.is_empty() {
                object.insert("dependsOnIds".to_string(), json!(deps));
            }
            module_objects.insert((*id).to_string(), serde_json::Value::Object(object));
        }

        let mut document = json!({
            "modules": module_objects,
            "mainModuleId": modules.last().map(|(id, _, _)| *id),
            "mainFunction": "zipline.main",
        });
        signer.sign(&mut document).unwrap();
        serde_json::to_vec(&document).unwrap()
    }

    fn mock_modules(server: &MockServer, modules: &[(&str, &[u8], &[&str])]) {
        for (id, content, _) in modules {
            let path = format!("/{}.zipline", id.trim_start_matches("./"));
            let body = content.to_vec();
            server.mock(move |when, then| {
                when.method(GET).path(path);
                then.status(200).body(body);
            });
        }
    }

    fn quick_client() -> HttpClient {
        HttpClient::new(HttpConfig {
            retry_count: 0,
            ..HttpConfig::default()
        })
        .unwrap()
    }

    fn verifier_for(signer: &ManifestSigner) -> ManifestVerifier {
        let mut verifier = ManifestVerifier::new();
        for (name, public_key) in signer.public_keys() {
            verifier = verifier.add_key(name, &public_key).unwrap();
        }
        verifier
    }

    async fn loader_with_cache(
        cache_dir: &std::path::Path,
        signer: &ManifestSigner,
        events: EventEmitter,
    ) -> Loader {
        LoaderBuilder::new()
            .with_http_client(quick_client())
            .with_verifier(verifier_for(signer))
            .with_events(events)
            .with_cache(CacheConfig::new(cache_dir))
            .build()
            .await
            .unwrap()
    }

    fn no_op_init(_receiver: &mut CollectingReceiver) -> Result<(), Error> {
        Ok(())
    }

    #[tokio::test]
    async fn test_load_receives_dependency_before_dependent() {
        let server = MockServer::start();
        let signer = ManifestSigner::new().add_key("sigA", SEED).unwrap();

        let modules: &[(&str, &[u8], &[&str])] = &[
            ("./kotlin.js", b"kotlin runtime", &[]),
            ("./app.js", b"application", &["./kotlin.js"]),
        ];
        let manifest_bytes = signed_manifest(&server, &signer, modules);

        // Delay the dependency's fetch; its hand-off must still come
        // first.
        server.mock(|when, then| {
            when.method(GET).path("/kotlin.js.zipline");
            then.status(200)
                .body(b"kotlin runtime")
                .delay(Duration::from_millis(100));
        });
        server.mock(|when, then| {
            when.method(GET).path("/app.js.zipline");
            then.status(200).body(b"application");
        });
        server.mock(move |when, then| {
            when.method(GET).path("/manifest.zipline.json");
            then.status(200).body(manifest_bytes);
        });

        let cache_dir = tempdir().unwrap();
        let loader = loader_with_cache(cache_dir.path(), &signer, EventEmitter::new()).await;

        let loaded = loader
            .load_or_fail(
                "app",
                Some(&server.url("/manifest.zipline.json")),
                CollectingReceiver::new,
                no_op_init,
            )
            .await
            .unwrap();

        let receiver = loaded.receiver;
        assert!(receiver.position("./kotlin.js") < receiver.position("./app.js"));
        assert_eq!(receiver.received[0].1, b"kotlin runtime");
    }

    #[tokio::test]
    async fn test_load_order_is_linear_extension_of_diamond() {
        let server = MockServer::start();
        let signer = ManifestSigner::new().add_key("sigA", SEED).unwrap();

        let modules: &[(&str, &[u8], &[&str])] = &[
            ("./base.js", b"base", &[]),
            ("./left.js", b"left", &["./base.js"]),
            ("./right.js", b"right", &["./base.js"]),
            ("./top.js", b"top", &["./left.js", "./right.js"]),
        ];
        let manifest_bytes = signed_manifest(&server, &signer, modules);
        mock_modules(&server, modules);
        server.mock(move |when, then| {
            when.method(GET).path("/manifest.zipline.json");
            then.status(200).body(manifest_bytes);
        });

        let cache_dir = tempdir().unwrap();
        let loader = loader_with_cache(cache_dir.path(), &signer, EventEmitter::new()).await;

        let loaded = loader
            .load_or_fail(
                "app",
                Some(&server.url("/manifest.zipline.json")),
                CollectingReceiver::new,
                no_op_init,
            )
            .await
            .unwrap();

        let r = loaded.receiver;
        assert!(r.position("./base.js") < r.position("./left.js"));
        assert!(r.position("./base.js") < r.position("./right.js"));
        assert!(r.position("./left.js") < r.position("./top.js"));
        assert!(r.position("./right.js") < r.position("./top.js"));
        assert_eq!(r.received.len(), 4);
    }

    #[tokio::test]
    async fn test_load_emits_lifecycle_events() {
        let server = MockServer::start();
        let signer = ManifestSigner::new().add_key("sigA", SEED).unwrap();

        let modules: &[(&str, &[u8], &[&str])] = &[("./app.js", b"application", &[])];
        let manifest_bytes = signed_manifest(&server, &signer, modules);
        mock_modules(&server, modules);
        server.mock(move |when, then| {
            when.method(GET).path("/manifest.zipline.json");
            then.status(200).body(manifest_bytes);
        });

        let (tx, mut rx) = channel();
        let cache_dir = tempdir().unwrap();
        let loader = loader_with_cache(
            cache_dir.path(),
            &signer,
            EventEmitter::new().with_sender(tx),
        )
        .await;

        loader
            .load_or_fail(
                "app",
                Some(&server.url("/manifest.zipline.json")),
                CollectingReceiver::new,
                no_op_init,
            )
            .await
            .unwrap();

        let mut saw_started = false;
        let mut saw_verified = false;
        let mut saw_received = false;
        let mut saw_ended = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::ApplicationLoadStarted { .. } => saw_started = true,
                Event::ManifestVerified { key_name, .. } => {
                    assert_eq!(key_name, "sigA");
                    saw_verified = true;
                }
                Event::ModuleReceived { id, .. } => {
                    assert_eq!(id, "./app.js");
                    saw_received = true;
                }
                Event::ApplicationLoadEnded { .. } => saw_ended = true,
                _ => {}
            }
        }
        assert!(saw_started && saw_verified && saw_received && saw_ended);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_load() {
        let server = MockServer::start();
        let signer = ManifestSigner::new().add_key("sigA", SEED).unwrap();

        let modules: &[(&str, &[u8], &[&str])] = &[("./app.js", b"expected bytes", &[])];
        let manifest_bytes = signed_manifest(&server, &signer, modules);
        server.mock(|when, then| {
            when.method(GET).path("/app.js.zipline");
            then.status(200).body(b"tampered bytes");
        });
        server.mock(move |when, then| {
            when.method(GET).path("/manifest.zipline.json");
            then.status(200).body(manifest_bytes);
        });

        let cache_dir = tempdir().unwrap();
        let loader = loader_with_cache(cache_dir.path(), &signer, EventEmitter::new()).await;

        let err = loader
            .load_or_fail(
                "app",
                Some(&server.url("/manifest.zipline.json")),
                CollectingReceiver::new,
                no_op_init,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_cycle_detected_before_any_fetch() {
        let server = MockServer::start();
        let signer = ManifestSigner::new().add_key("sigA", SEED).unwrap();

        let modules: &[(&str, &[u8], &[&str])] = &[
            ("./a.js", b"a", &["./b.js"]),
            ("./b.js", b"b", &["./a.js"]),
        ];
        let manifest_bytes = signed_manifest(&server, &signer, modules);
        let module_mock = server.mock(|when, then| {
            when.method(GET).path_contains(".js.zipline");
            then.status(200).body(b"whatever");
        });
        server.mock(move |when, then| {
            when.method(GET).path("/manifest.zipline.json");
            then.status(200).body(manifest_bytes);
        });

        let cache_dir = tempdir().unwrap();
        let loader = loader_with_cache(cache_dir.path(), &signer, EventEmitter::new()).await;

        let err = loader
            .load_or_fail(
                "app",
                Some(&server.url("/manifest.zipline.json")),
                CollectingReceiver::new,
                no_op_init,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
        module_mock.assert_hits(0);
    }

    #[tokio::test]
    async fn test_missing_dependency_fails_validation() {
        let server = MockServer::start();
        let signer = ManifestSigner::new().add_key("sigA", SEED).unwrap();

        let modules: &[(&str, &[u8], &[&str])] = &[("./app.js", b"app", &["./ghost.js"])];
        let manifest_bytes = signed_manifest(&server, &signer, modules);
        server.mock(move |when, then| {
            when.method(GET).path("/manifest.zipline.json");
            then.status(200).body(manifest_bytes);
        });

        let cache_dir = tempdir().unwrap();
        let loader = loader_with_cache(cache_dir.path(), &signer, EventEmitter::new()).await;

        let err = loader
            .load_or_fail(
                "app",
                Some(&server.url("/manifest.zipline.json")),
                CollectingReceiver::new,
                no_op_init,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("./ghost.js"));
    }

    #[tokio::test]
    async fn test_failed_initializer_fails_load_and_emits() {
        let server = MockServer::start();
        let signer = ManifestSigner::new().add_key("sigA", SEED).unwrap();

        let modules: &[(&str, &[u8], &[&str])] = &[("./app.js", b"app", &[])];
        let manifest_bytes = signed_manifest(&server, &signer, modules);
        mock_modules(&server, modules);
        server.mock(move |when, then| {
            when.method(GET).path("/manifest.zipline.json");
            then.status(200).body(manifest_bytes);
        });

        let (tx, mut rx) = channel();
        let cache_dir = tempdir().unwrap();
        let loader = loader_with_cache(
            cache_dir.path(),
            &signer,
            EventEmitter::new().with_sender(tx),
        )
        .await;

        let err = loader
            .load_or_fail(
                "app",
                Some(&server.url("/manifest.zipline.json")),
                CollectingReceiver::new,
                |_receiver: &mut CollectingReceiver| Err(Error::internal("smoke test failed")),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("smoke test failed"));

        let mut saw_failed = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::ApplicationLoadFailed { error, .. } = event {
                assert!(error.contains("smoke test failed"));
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_failed_receiver_fails_load() {
        #[derive(Debug)]
        struct FailingReceiver;

        #[async_trait]
        impl Receiver for FailingReceiver {
            async fn receive(
                &mut self,
                _bytes: Vec<u8>,
                _id: &str,
                _sha256: &Sha256Digest,
            ) -> Result<(), Error> {
                Err(Error::internal("engine is broken"))
            }
        }

        let server = MockServer::start();
        let signer = ManifestSigner::new().add_key("sigA", SEED).unwrap();

        let modules: &[(&str, &[u8], &[&str])] = &[("./app.js", b"app", &[])];
        let manifest_bytes = signed_manifest(&server, &signer, modules);
        mock_modules(&server, modules);
        server.mock(move |when, then| {
            when.method(GET).path("/manifest.zipline.json");
            then.status(200).body(manifest_bytes);
        });

        let cache_dir = tempdir().unwrap();
        let loader = loader_with_cache(cache_dir.path(), &signer, EventEmitter::new()).await;

        let err = loader
            .load_or_fail(
                "app",
                Some(&server.url("/manifest.zipline.json")),
                || FailingReceiver,
                |_: &mut FailingReceiver| Ok(()),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("receiver failed"));
    }

    #[tokio::test]
    async fn test_load_or_fall_back_serves_pinned_app_offline() {
        let server = MockServer::start();
        let signer = ManifestSigner::new().add_key("sigA", SEED).unwrap();

        let modules: &[(&str, &[u8], &[&str])] = &[("./app.js", b"pinned app", &[])];
        let manifest_bytes = signed_manifest(&server, &signer, modules);
        let module_mock = server.mock(|when, then| {
            when.method(GET).path("/app.js.zipline");
            then.status(200).body(b"pinned app");
        });
        server.mock(move |when, then| {
            when.method(GET).path("/manifest.zipline.json");
            then.status(200).body(manifest_bytes);
        });

        let cache_dir = tempdir().unwrap();
        let loader = loader_with_cache(cache_dir.path(), &signer, EventEmitter::new()).await;

        // First load succeeds online and pins.
        loader
            .load_or_fail(
                "app",
                Some(&server.url("/manifest.zipline.json")),
                CollectingReceiver::new,
                no_op_init,
            )
            .await
            .unwrap();
        module_mock.assert_hits(1);

        // Second load with an unreachable manifest URL falls back to
        // the pinned manifest; modules come from the cache.
        let loaded = loader
            .load_or_fall_back(
                "app",
                "http://127.0.0.1:9/manifest.zipline.json",
                CollectingReceiver::new,
                no_op_init,
            )
            .await
            .unwrap();

        assert_eq!(loaded.receiver.received[0].1, b"pinned app");
        module_mock.assert_hits(1);
    }

    #[tokio::test]
    async fn test_download_writes_bundle_served_by_embedded_fetcher() {
        let server = MockServer::start();
        let signer = ManifestSigner::new().add_key("sigA", SEED).unwrap();

        let modules: &[(&str, &[u8], &[&str])] = &[
            ("./kotlin.js", b"kotlin runtime", &[]),
            ("./app.js", b"application", &["./kotlin.js"]),
        ];
        let manifest_bytes = signed_manifest(&server, &signer, modules);
        mock_modules(&server, modules);
        server.mock(move |when, then| {
            when.method(GET).path("/manifest.zipline.json");
            then.status(200).body(manifest_bytes);
        });

        let cache_dir = tempdir().unwrap();
        let bundle_dir = tempdir().unwrap();
        let loader = loader_with_cache(cache_dir.path(), &signer, EventEmitter::new()).await;

        loader
            .download(
                "app",
                bundle_dir.path(),
                Some(&server.url("/manifest.zipline.json")),
            )
            .await
            .unwrap();

        // The bundle holds the manifest and one file per module hash.
        assert!(bundle_dir.path().join("app.manifest.zipline.json").exists());
        for (_, content, _) in modules {
            let path = bundle_dir
                .path()
                .join(Sha256Digest::digest(content).to_hex());
            assert_eq!(&tokio::fs::read(&path).await.unwrap(), content);
        }

        // A loader with no network serves the bundle as embedded.
        let offline_cache = tempdir().unwrap();
        let offline = LoaderBuilder::new()
            .with_http_client(quick_client())
            .with_verifier(verifier_for(&signer))
            .with_cache(CacheConfig::new(offline_cache.path()))
            .with_embedded_dir(bundle_dir.path())
            .build()
            .await
            .unwrap();

        let loaded = offline
            .load_or_fail("app", None, CollectingReceiver::new, no_op_init)
            .await
            .unwrap();
        assert_eq!(loaded.receiver.received.len(), 2);
    }

    #[tokio::test]
    async fn test_load_continuously_dedupes_by_manifest_content() {
        let server = MockServer::start();
        let signer = ManifestSigner::new().add_key("sigA", SEED).unwrap();

        let v1: &[(&str, &[u8], &[&str])] = &[("./app.js", b"version one", &[])];
        let v1_manifest = signed_manifest(&server, &signer, v1);
        mock_modules(&server, v1);
        let mut v1_mock = server.mock(move |when, then| {
            when.method(GET).path("/manifest.zipline.json");
            then.status(200).body(v1_manifest);
        });

        let cache_dir = tempdir().unwrap();
        let loader = Arc::new(
            loader_with_cache(cache_dir.path(), &signer, EventEmitter::new()).await,
        );

        let sessions = load_continuously(
            Arc::clone(&loader),
            "app".to_string(),
            futures::stream::iter(vec![server.url("/manifest.zipline.json")]),
            Duration::from_millis(50),
            CollectingReceiver::new,
            |_: &mut CollectingReceiver| Ok(()),
        );
        futures::pin_mut!(sessions);

        let first: LoadedApp<CollectingReceiver> =
            tokio::time::timeout(Duration::from_secs(5), sessions.next())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(first.receiver.received[0].1, b"version one");

        // Same manifest keeps being served: no new session within a few
        // poll intervals.
        let quiet =
            tokio::time::timeout(Duration::from_millis(300), sessions.as_mut().next()).await;
        assert!(quiet.is_err());

        // Publish a new build at the same URL.
        v1_mock.delete();
        let v2: &[(&str, &[u8], &[&str])] = &[("./app-v2.js", b"version two", &[])];
        let v2_manifest = signed_manifest(&server, &signer, v2);
        mock_modules(&server, v2);
        server.mock(move |when, then| {
            when.method(GET).path("/manifest.zipline.json");
            then.status(200).body(v2_manifest);
        });

        let second: LoadedApp<CollectingReceiver> =
            tokio::time::timeout(Duration::from_secs(5), sessions.next())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(second.receiver.received[0].1, b"version two");
    }

    #[tokio::test]
    async fn test_download_receiver_writes_by_hash() {
        let temp = tempdir().unwrap();
        let mut receiver = DownloadReceiver::new(temp.path());

        let content = b"some module".to_vec();
        let hash = Sha256Digest::digest(&content);
        receiver
            .receive(content.clone(), "./m.js", &hash)
            .await
            .unwrap();

        let written = tokio::fs::read(temp.path().join(hash.to_hex())).await.unwrap();
        assert_eq!(written, content);
    }
}
