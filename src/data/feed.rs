//! Slice feed
//!
//! Reads JSON-lines market slices from a replay file or standard input and
//! forwards them into the engine's channel. Blank lines are skipped;
//! malformed lines and slices that go back in time for their instrument are
//! logged and dropped so the engine only ever sees ordered input.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::types::MarketSlice;

/// Where slices come from
#[derive(Debug, Clone)]
pub enum FeedSource {
    Replay(PathBuf),
    Stdin,
}

/// Counters reported when the feed ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub forwarded: usize,
    pub malformed: usize,
    pub out_of_order: usize,
}

/// Parsed lines of a JSON-lines reader, with their 1-based line number
pub fn slice_stream<R>(reader: R) -> impl Stream<Item = (usize, Result<MarketSlice>)>
where
    R: AsyncBufRead + Unpin,
{
    futures_util::stream::unfold((reader.lines(), 0usize), |(mut lines, mut n)| async move {
        loop {
            n += 1;
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let parsed = serde_json::from_str::<MarketSlice>(&line)
                        .with_context(|| format!("line {}", n));
                    return Some(((n, parsed), (lines, n)));
                }
                Ok(None) => return None,
                Err(e) => return Some(((n, Err(e.into())), (lines, n))),
            }
        }
    })
}

/// Drain a reader into the channel
///
/// Stops early when the receiver is gone.
pub async fn forward<R>(reader: R, tx: mpsc::Sender<MarketSlice>) -> FeedStats
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = FeedStats::default();
    let mut last_seen: HashMap<String, DateTime<Utc>> = HashMap::new();
    let stream = slice_stream(reader);
    tokio::pin!(stream);

    while let Some((line, parsed)) = stream.next().await {
        let slice = match parsed {
            Ok(slice) => slice,
            Err(e) => {
                warn!(line, error = %format!("{:#}", e), "skipping malformed slice");
                stats.malformed += 1;
                continue;
            }
        };

        if let Some(prev) = last_seen.get(&slice.instrument) {
            if slice.timestamp < *prev {
                warn!(
                    line,
                    instrument = %slice.instrument,
                    timestamp = %slice.timestamp,
                    previous = %prev,
                    "dropping out-of-order slice"
                );
                stats.out_of_order += 1;
                continue;
            }
        }
        last_seen.insert(slice.instrument.clone(), slice.timestamp);

        if tx.send(slice).await.is_err() {
            info!("engine channel closed, feed stopping");
            break;
        }
        stats.forwarded += 1;
    }

    stats
}

/// Spawn the reader task for a source
pub async fn spawn_feed(
    source: FeedSource,
    tx: mpsc::Sender<MarketSlice>,
) -> Result<JoinHandle<FeedStats>> {
    let handle = match source {
        FeedSource::Replay(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open replay file {}", path.display()))?;
            info!(path = %path.display(), "replaying slices");
            tokio::spawn(forward(BufReader::new(file), tx))
        }
        FeedSource::Stdin => {
            info!("reading slices from stdin");
            tokio::spawn(forward(BufReader::new(tokio::io::stdin()), tx))
        }
    };
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT: &str = r#"{"timestamp":"2024-03-01T09:30:00Z","instrument":"BTC","features":{"close":100.0}}

{"timestamp":"2024-03-01T09:31:00Z","instrument":"ETH"}
not json
{"timestamp":"2024-03-01T09:29:00Z","instrument":"BTC"}
{"timestamp":"2024-03-01T09:32:00Z","instrument":"BTC","features":{"close":101.0}}
"#;

    #[tokio::test]
    async fn test_forward_filters_input() {
        let (tx, mut rx) = mpsc::channel(16);
        let stats = forward(INPUT.as_bytes(), tx).await;

        assert_eq!(stats, FeedStats { forwarded: 3, malformed: 1, out_of_order: 1 });

        let mut got = Vec::new();
        while let Some(slice) = rx.recv().await {
            got.push(slice);
        }
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].feature("close"), Some(100.0));
        assert_eq!(got[1].instrument, "ETH");
        assert!(got[1].features.is_empty());
        assert_eq!(got[2].feature("close"), Some(101.0));
    }

    #[tokio::test]
    async fn test_stream_reports_line_numbers() {
        let stream = slice_stream(INPUT.as_bytes());
        let lines: Vec<usize> = stream.map(|(n, _)| n).collect().await;
        assert_eq!(lines, vec![1, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_forward_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let stats = forward(INPUT.as_bytes(), tx).await;
        assert_eq!(stats.forwarded, 0);
    }

    #[tokio::test]
    async fn test_missing_replay_file() {
        let (tx, _rx) = mpsc::channel(1);
        let path = std::env::temp_dir().join("agora_no_such_replay.jsonl");
        assert!(spawn_feed(FeedSource::Replay(path), tx).await.is_err());
    }
}
