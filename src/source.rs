// Sample source
// Reads newline-delimited JSON playback samples from stdin or a file

use crate::normalizer::RawPlaybackSample;
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Forward every JSON line from `reader` as a sample stamped with its arrival
/// time. Returns the number of samples forwarded.
pub async fn read_lines<R>(reader: R, samples: &mpsc::Sender<RawPlaybackSample>) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;

    while let Some(line) = lines.next_line().await.context("Failed to read sample")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let payload = match serde_json::from_str(line) {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("Skipping unparsable sample: {}", e);
                continue;
            }
        };

        if samples
            .send(RawPlaybackSample::new(payload, Utc::now()))
            .await
            .is_err()
        {
            // Dispatcher is gone
            break;
        }
        forwarded += 1;
    }

    Ok(forwarded)
}

/// Read samples from `path`, or stdin when no path is given
pub async fn read_samples(path: Option<&Path>, samples: mpsc::Sender<RawPlaybackSample>) -> Result<()> {
    let forwarded = match path {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open sample input {}", path.display()))?;
            log::info!("Reading samples from {}", path.display());
            read_lines(BufReader::new(file), &samples).await?
        }
        None => {
            log::info!("Reading samples from stdin");
            read_lines(BufReader::new(tokio::io::stdin()), &samples).await?
        }
    };

    log::debug!("Sample input ended after {} samples", forwarded);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_json_lines_and_skips_garbage() {
        let input = concat!(
            "{\"title\":\"T1\",\"artist\":\"A\",\"currentTime\":1}\n",
            "\n",
            "not json\n",
            "  {\"title\":\"T1\",\"artist\":\"A\",\"currentTime\":2}  \n",
        );
        let (tx, mut rx) = mpsc::channel(8);

        let forwarded = read_lines(input.as_bytes(), &tx).await.unwrap();
        assert_eq!(forwarded, 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload["currentTime"], 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload["currentTime"], 2);
        assert!(second.received_at >= first.received_at);
    }

    #[tokio::test]
    async fn stops_when_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let forwarded = read_lines("{\"title\":\"T\"}\n".as_bytes(), &tx).await.unwrap();
        assert_eq!(forwarded, 0);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let (tx, _rx) = mpsc::channel(1);
        let err = read_samples(Some(Path::new("/nonexistent/samples.ndjson")), tx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to open sample input"));
    }
}
