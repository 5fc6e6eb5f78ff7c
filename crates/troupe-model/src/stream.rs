// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::future::Future;
use std::pin::Pin;

use anyhow::bail;
use futures::{Stream, StreamExt};
use tracing::warn;

use crate::CompletionRound;

/// Low-level item produced by a driver's streaming parser.
pub(crate) enum RoundChunk {
    /// A text delta to surface immediately.
    Text(String),
    /// The assembled final round. Always the last successful item.
    Round(CompletionRound),
}

pub(crate) type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<RoundChunk>> + Send>>;

/// A streaming model round.
///
/// Yields text deltas via [`next_delta`](RoundStream::next_delta) until
/// exhausted; only then does [`into_round`](RoundStream::into_round) return
/// the final [`CompletionRound`].
pub struct RoundStream {
    inner: Option<ChunkStream>,
    round: Option<CompletionRound>,
}

impl RoundStream {
    pub(crate) fn new(inner: ChunkStream) -> Self {
        Self {
            inner: Some(inner),
            round: None,
        }
    }

    /// A delta-less stream wrapping an already-complete round. Used by the
    /// non-streaming fallback and by the trait's default implementation.
    pub fn from_round(round: CompletionRound) -> Self {
        Self {
            inner: None,
            round: Some(round),
        }
    }

    /// Next text delta, or `None` once the stream is exhausted.
    ///
    /// Mid-stream transport errors are surfaced here; the caller decides
    /// whether to abandon the turn.
    pub async fn next_delta(&mut self) -> Option<anyhow::Result<String>> {
        let inner = self.inner.as_mut()?;
        while let Some(item) = inner.next().await {
            match item {
                Ok(RoundChunk::Text(t)) => return Some(Ok(t)),
                Ok(RoundChunk::Round(r)) => {
                    self.round = Some(r);
                    self.inner = None;
                    return None;
                }
                Err(e) => {
                    self.inner = None;
                    return Some(Err(e));
                }
            }
        }
        self.inner = None;
        None
    }

    /// The final round. Errors if the stream was not consumed to completion
    /// (including the mid-stream error case).
    pub fn into_round(self) -> anyhow::Result<CompletionRound> {
        match self.round {
            Some(r) => Ok(r),
            None => bail!("stream ended without a final round"),
        }
    }
}

/// Wrap a live chunk stream so that a failure *before the first delta*
/// transparently falls back to the non-streaming `fallback` completion.
/// Failures after a delta has been produced are surfaced unchanged.
pub(crate) async fn guard_pre_delta<F>(chunks: ChunkStream, fallback: F) -> anyhow::Result<RoundStream>
where
    F: Future<Output = anyhow::Result<CompletionRound>>,
{
    let mut chunks = chunks;
    match chunks.next().await {
        None => {
            // Stream closed before producing anything – treat as pre-delta failure.
            warn!("stream closed before first event; falling back to non-streaming");
            Ok(RoundStream::from_round(fallback.await?))
        }
        Some(Err(e)) => {
            warn!(error = %e, "stream failed before first event; falling back to non-streaming");
            Ok(RoundStream::from_round(fallback.await?))
        }
        Some(Ok(first)) => {
            let rest = futures::stream::iter(std::iter::once(Ok(first))).chain(chunks);
            Ok(RoundStream::new(Box::pin(rest)))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
