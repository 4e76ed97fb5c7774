//! Continuous loading
//!
//! Polls a stream of manifest URLs, re-checking at least every poll
//! interval, and runs one full load per *distinct* manifest. Distinct
//! means distinct content: the same build served from two CDNs
//! collapses into one session.

use crate::{LoadedApp, Loader, Receiver};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use zipline_errors::Error;
use zipline_hash::Sha256Digest;

/// Poll `urls` and emit one loaded session per distinct manifest.
///
/// Each upstream URL is re-emitted at least every `poll_interval`
/// (re-checking the last URL while upstream is quiet); URLs arriving
/// faster pass through. Failed polls are dropped, surfacing only as
/// telemetry events. Dropping the returned stream cancels the driver
/// and any in-flight fetches.
pub fn load_continuously<R, N, I, S>(
    loader: Arc<Loader>,
    app_name: String,
    urls: S,
    poll_interval: Duration,
    new_receiver: N,
    initializer: I,
) -> impl Stream<Item = LoadedApp<R>>
where
    R: Receiver + 'static,
    N: Fn() -> R + Send + Sync + 'static,
    I: Fn(&mut R) -> Result<(), Error> + Send + Sync + 'static,
    S: Stream<Item = String> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(drive(
        loader,
        app_name,
        urls,
        poll_interval,
        new_receiver,
        initializer,
        tx,
    ));

    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|session| (session, rx))
    })
}

async fn drive<R, N, I, S>(
    loader: Arc<Loader>,
    app_name: String,
    urls: S,
    poll_interval: Duration,
    new_receiver: N,
    initializer: I,
    tx: mpsc::Sender<LoadedApp<R>>,
) where
    R: Receiver + 'static,
    N: Fn() -> R + Send + Sync + 'static,
    I: Fn(&mut R) -> Result<(), Error> + Send + Sync + 'static,
    S: Stream<Item = String> + Send + 'static,
{
    let mut urls = Box::pin(urls.fuse());
    let mut last_url: Option<String> = None;
    let mut last_loaded: Option<Sha256Digest> = None;

    loop {
        let Some(url) = next_rebounced(&mut urls, &mut last_url, poll_interval).await else {
            break;
        };

        // Fetch and verify; a failed poll is dropped.
        let Ok((_, manifest)) = loader
            .fetch_and_verify_manifest(&app_name, Some(&url))
            .await
        else {
            continue;
        };

        // Dedupe by verified content, not by URL.
        let Ok(content_hash) = manifest.content_hash() else {
            continue;
        };
        if last_loaded == Some(content_hash) {
            continue;
        }

        let load = loader.load_or_fail(&app_name, Some(&url), &new_receiver, &initializer);
        tokio::select! {
            session = load => {
                if let Ok(session) = session {
                    last_loaded = Some(content_hash);
                    if tx.send(session).await.is_err() {
                        break;
                    }
                }
            }
            // The consumer dropped the stream; cancel in-flight work.
            () = tx.closed() => break,
        }
    }
}

/// Next URL to check: a fresh upstream value if one arrives within the
/// poll interval, otherwise the last value again. `None` ends the
/// sequence (upstream finished before producing anything).
async fn next_rebounced<S>(
    urls: &mut S,
    last_url: &mut Option<String>,
    poll_interval: Duration,
) -> Option<String>
where
    S: Stream<Item = String> + Unpin,
{
    match last_url.clone() {
        None => {
            let url = urls.next().await?;
            *last_url = Some(url.clone());
            Some(url)
        }
        Some(previous) => {
            tokio::select! {
                next = urls.next() => match next {
                    Some(url) => {
                        *last_url = Some(url.clone());
                        Some(url)
                    }
                    // Upstream ended; keep re-checking the last URL.
                    None => {
                        tokio::time::sleep(poll_interval).await;
                        Some(previous)
                    }
                },
                () = tokio::time::sleep(poll_interval) => Some(previous),
            }
        }
    }
}
