//! JSON-lines event ingest
//!
//! Each line wraps one raw platform payload:
//!
//! ```json
//! {"platform": "telegram", "payload": {"update_id": 1, "message": {...}}}
//! ```
//!
//! Lines are classified into messages, joins and leaves and sent to the
//! engine serving that platform. Engine channels are bounded, so a slow
//! engine slows the reader down instead of buffering without limit.

use crate::adapters::classify;
use chrono::Utc;
use rally_core::{Platform, RallyError};
use rally_engine::EngineInput;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

/// One ingest line
#[derive(Debug, Deserialize)]
pub struct IngestLine {
    pub platform: Platform,
    pub payload: Value,
}

/// Counters of one ingest run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub lines: u64,
    pub routed: u64,
    pub malformed: u64,
    /// Lines for a platform no engine serves
    pub unrouted: u64,
}

/// Per-platform input channels
#[derive(Default)]
pub struct Router {
    routes: HashMap<Platform, mpsc::Sender<EngineInput<Value>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, platform: Platform, tx: mpsc::Sender<EngineInput<Value>>) {
        self.routes.insert(platform, tx);
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<_> = self.routes.keys().copied().collect();
        platforms.sort();
        platforms
    }

    /// Parse and deliver one line
    async fn route(&self, line: &str, stats: &mut IngestStats) {
        let parsed: IngestLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                stats.malformed += 1;
                tracing::warn!(line = stats.lines, error = %e, "Malformed ingest line");
                return;
            }
        };

        let Some(tx) = self.routes.get(&parsed.platform) else {
            stats.unrouted += 1;
            tracing::debug!(platform = %parsed.platform, "No engine for platform");
            return;
        };

        for input in classify(parsed.platform, parsed.payload, Utc::now()) {
            if tx.send(input).await.is_err() {
                stats.unrouted += 1;
                tracing::warn!(platform = %parsed.platform, "Engine input closed, line dropped");
                return;
            }
        }
        stats.routed += 1;
    }

    /// Read lines until EOF, routing each one
    pub async fn pump<R>(&self, reader: R) -> Result<IngestStats, RallyError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut stats = IngestStats::default();
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            stats.lines += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.route(line, &mut stats).await;
        }

        tracing::info!(
            lines = stats.lines,
            routed = stats.routed,
            malformed = stats.malformed,
            unrouted = stats.unrouted,
            "Ingest finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_by_platform() {
        let (tg_tx, mut tg_rx) = mpsc::channel(8);
        let mut router = Router::new();
        router.add_route(Platform::Telegram, tg_tx);

        let input = concat!(
            r#"{"platform":"telegram","payload":{"update_id":1,"message":{"message_id":1,"from":{"id":5},"chat":{"id":9},"date":1714554000,"text":"hi there friends"}}}"#,
            "\n",
            "\n",
            "not json\n",
            r#"{"platform":"discord","payload":{"t":"MESSAGE_CREATE","d":{}}}"#,
            "\n",
            r#"{"platform":"telegram","payload":{"chat_member":{"chat":{"id":9},"from":{"id":5},"date":1714554000,"old_chat_member":{"user":{"id":5},"status":"member"},"new_chat_member":{"user":{"id":5},"status":"left"}}}}"#,
            "\n",
        );

        let stats = router.pump(input.as_bytes()).await.unwrap();
        assert_eq!(
            stats,
            IngestStats {
                lines: 5,
                routed: 2,
                malformed: 1,
                unrouted: 1,
            }
        );

        assert!(matches!(tg_rx.recv().await, Some(EngineInput::Message(_))));
        assert!(matches!(tg_rx.recv().await, Some(EngineInput::Leave(_))));
    }

    #[tokio::test]
    async fn test_service_message_fans_out_joins() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut router = Router::new();
        router.add_route(Platform::Telegram, tx);

        let line = r#"{"platform":"telegram","payload":{"update_id":3,"message":{"message_id":8,"from":{"id":12},"chat":{"id":9},"date":1714554000,"new_chat_members":[{"id":300},{"id":301}]}}}"#;
        let stats = router.pump(line.as_bytes()).await.unwrap();
        assert_eq!(stats.routed, 1);

        for expected in ["300", "301"] {
            match rx.recv().await {
                Some(EngineInput::Join(join)) => {
                    assert_eq!(join.new_user_id, expected);
                    assert_eq!(join.platform_inviter_id.as_deref(), Some("12"));
                }
                other => panic!("expected join, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_closed_engine_counts_unrouted() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut router = Router::new();
        router.add_route(Platform::Discord, tx);

        let line = r#"{"platform":"discord","payload":{"t":"GUILD_MEMBER_REMOVE","d":{"user":{"id":"1"}}}}"#;
        let stats = router.pump(line.as_bytes()).await.unwrap();
        assert_eq!(stats.unrouted, 1);
        assert_eq!(stats.routed, 0);
        assert_eq!(router.platforms(), vec![Platform::Discord]);
    }
}
