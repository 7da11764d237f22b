//! JSON-lines observations from stdin into the in-memory broker

use rolewatch_engine::InMemoryBroker;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

/// Publish each stdin line; lines carrying an `action` field go to the
/// action topic
pub fn spawn(broker: Arc<InMemoryBroker>, observation_topic: String, action_topic: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut published = 0u64;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    broker.publish(topic_for(line, &observation_topic, &action_topic), line.as_bytes().to_vec());
                    published += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("stdin read failed: {}", e);
                    break;
                }
            }
        }
        tracing::info!("stdin closed after {} messages", published);
    })
}

fn topic_for<'a>(line: &str, observation_topic: &'a str, action_topic: &'a str) -> &'a str {
    // Unparseable lines still go through so the worker counts them as malformed
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(value) if value.get("action").is_some() => action_topic,
        _ => observation_topic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_routing() {
        let obs = "rolewatch.observations";
        let act = "rolewatch.action";
        assert_eq!(topic_for(r#"{"identity":"a","timestamp":1}"#, obs, act), obs);
        assert_eq!(topic_for(r#"{"action":"clear-ignored"}"#, obs, act), act);
        assert_eq!(topic_for("garbage", obs, act), obs);
    }
}
