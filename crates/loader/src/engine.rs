//! Dependency-ordered receive engine
//!
//! One job per module, all started concurrently. A job fetches its
//! bytes under the download limiter, verifies the content hash, then
//! waits for every predecessor to be *received* before enqueueing its
//! own hand-off. Hand-offs drain through a single-consumer channel, so
//! the receiver is never invoked concurrently.
//!
//! Wait-sets are wired up before any job is spawned: each module gets a
//! completion channel, and downstream jobs hold clones of their
//! predecessors' receivers from the start. A short job that finishes
//! before its siblings even run leaves its completed state behind for
//! them to observe.

use crate::Receiver;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use zipline_errors::{Error, LoaderError, NetworkError};
use zipline_events::{Event, EventEmitter};
use zipline_hash::Sha256Digest;
use zipline_manifest::{Manifest, Module};
use zipline_net::{ConcurrencyLimiter, FetcherChain, HttpClient};

/// A fetched module waiting for its serialized hand-off
struct Handoff {
    id: String,
    bytes: Vec<u8>,
    sha256: Sha256Digest,
    /// Signalled once the receiver has accepted this module
    received: watch::Sender<bool>,
}

/// Fetch every module of `manifest` in parallel and hand each to
/// `receiver` once all of its dependencies have been received.
///
/// # Errors
/// Surfaces the first failing job's error after cancelling its
/// siblings. Partial receiver effects are not undone.
pub(crate) async fn receive_modules<R: Receiver>(
    chain: &Arc<FetcherChain>,
    limiter: &Arc<ConcurrencyLimiter>,
    client: &HttpClient,
    events: &EventEmitter,
    app_name: &str,
    manifest: &Manifest,
    manifest_url: Option<&str>,
    receiver: &mut R,
) -> Result<(), Error> {
    let (handoff_tx, mut handoff_rx) = mpsc::channel::<Handoff>(1);

    // Completion channels for every module, created before any job
    // starts.
    let mut received_txs = HashMap::new();
    let mut received_rxs = HashMap::new();
    for id in manifest.modules.keys() {
        let (tx, rx) = watch::channel(false);
        received_txs.insert(id.clone(), tx);
        received_rxs.insert(id.clone(), rx);
    }

    let mut jobs = JoinSet::new();
    for (id, module) in &manifest.modules {
        let wait_for: Vec<watch::Receiver<bool>> = module
            .depends_on_ids
            .iter()
            .filter_map(|dep| received_rxs.get(dep).cloned())
            .collect();
        let received = received_txs
            .remove(id)
            .ok_or_else(|| Error::internal(format!("duplicate module id {id}")))?;
        let url = match manifest_url {
            Some(base) => client.resolve(base, &module.url)?,
            None => module.url.clone(),
        };

        jobs.spawn(module_job(
            Arc::clone(chain),
            Arc::clone(limiter),
            app_name.to_string(),
            id.clone(),
            module.clone(),
            url,
            wait_for,
            received,
            handoff_tx.clone(),
        ));
    }
    drop(handoff_tx);
    drop(received_rxs);

    let result = loop {
        tokio::select! {
            handoff = handoff_rx.recv() => match handoff {
                Some(handoff) => {
                    if let Err(e) = receiver
                        .receive(handoff.bytes, &handoff.id, &handoff.sha256)
                        .await
                    {
                        break Err(LoaderError::ReceiverFailed {
                            id: handoff.id,
                            message: e.to_string(),
                        }
                        .into());
                    }
                    events.emit(Event::ModuleReceived {
                        app_name: app_name.to_string(),
                        id: handoff.id,
                    });
                    let _ = handoff.received.send(true);
                }
                // Every job is done and has handed off.
                None => break Ok(()),
            },
            Some(joined) = jobs.join_next() => match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => break Err(e),
                Err(e) => break Err(Error::internal(format!("module job panicked: {e}"))),
            },
        }
    };

    if result.is_err() {
        // Cancel siblings at their next suspension point.
        jobs.abort_all();
        while jobs.join_next().await.is_some() {}
    }

    result
}

/// Fetch, verify, await predecessors, enqueue for hand-off.
#[allow(clippy::too_many_arguments)]
async fn module_job(
    chain: Arc<FetcherChain>,
    limiter: Arc<ConcurrencyLimiter>,
    app_name: String,
    id: String,
    module: Module,
    url: String,
    wait_for: Vec<watch::Receiver<bool>>,
    received: watch::Sender<bool>,
    handoff_tx: mpsc::Sender<Handoff>,
) -> Result<(), Error> {
    // The limiter bounds the byte transfer only; the chain acquires it
    // around network access. Dependency waits below hold no permit, so
    // chains deeper than the download capacity cannot deadlock.
    let bytes = chain
        .fetch(&limiter, &app_name, &id, &module.sha256, &url)
        .await?;

    let actual = Sha256Digest::digest(&bytes);
    if actual != module.sha256 {
        return Err(NetworkError::ChecksumMismatch {
            expected: module.sha256.to_hex(),
            actual: actual.to_hex(),
        }
        .into());
    }

    for mut dependency in wait_for {
        dependency
            .wait_for(|received| *received)
            .await
            .map_err(|_| Error::Cancelled)?;
    }

    handoff_tx
        .send(Handoff {
            id,
            bytes,
            sha256: module.sha256,
            received,
        })
        .await
        .map_err(|_| Error::Cancelled)?;

    Ok(())
}
