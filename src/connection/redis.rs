//! Redis Backend
//!
//! `StoreBackend` over a fred connection pool. Versioned writes run as a single
//! Lua script so the version check, the overwrite and the version bump are one
//! atomic server-side step. Pub/sub uses a dedicated subscriber client that
//! re-establishes its subscriptions after reconnecting; each channel or
//! pattern stays subscribed only while a stream for it is alive.

use super::backend::*;
use super::url::StoreUrl;
use crate::constants::{CHANNEL_CAPACITY, SCAN_PAGE_SIZE};
use crate::error::{Error, Result};
use crate::helpers::glob_match;
use async_trait::async_trait;
use fred::clients::{Pool, SubscriberClient};
use fred::interfaces::{
    ClientLike, EventInterface, HashesInterface, LuaInterface, PubsubInterface,
};
use fred::types::Builder;
use fred::types::Message;
use fred::types::config::{Config, ReconnectPolicy};
use fred::types::scan::Scanner;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;

const WRITE_VERSIONED_SCRIPT: &str = r#"
local key = KEYS[1]
local expected = ARGV[1]
local now = ARGV[2]
local current = redis.call('HGET', key, 'version')
local current_n = 0
if current then
  current_n = tonumber(current)
  if current_n == nil then
    return {'corrupt', current}
  end
end
if expected ~= '' and tonumber(expected) ~= current_n then
  return {'conflict', tostring(current_n)}
end
local previous = redis.call('HGETALL', key)
local created = redis.call('HGET', key, 'created_at')
if not created then
  created = now
end
local new_version = current_n + 1
redis.call('DEL', key)
redis.call('HSET', key, 'version', tostring(new_version), 'created_at', created, 'updated_at', now)
for i = 3, #ARGV, 2 do
  redis.call('HSET', key, ARGV[i], ARGV[i + 1])
end
local result = {'ok', tostring(new_version), created}
for i = 1, #previous do
  result[#result + 1] = previous[i]
end
return result
"#;

const DELETE_SCRIPT: &str = r#"
local version = redis.call('HGET', KEYS[1], 'version')
if redis.call('DEL', KEYS[1]) == 0 then
  return false
end
return version or '0'
"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubscriptionKind {
    Channel,
    Pattern,
}

/// Releases one stream's hold on a channel or pattern when the stream is dropped
struct SubscriptionGuard {
    subscriber: SubscriberClient,
    counts: Arc<SubscriptionCounts>,
    kind: SubscriptionKind,
    name: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let subscriber = self.subscriber.clone();
        let counts = self.counts.clone();
        let kind = self.kind;
        let name = std::mem::take(&mut self.name);
        runtime.spawn(async move {
            let released = counts
                .release(&name, || async {
                    tracing::debug!("Unsubscribing from {}", name);
                    match kind {
                        SubscriptionKind::Channel => subscriber.unsubscribe(name.as_str()).await?,
                        SubscriptionKind::Pattern => subscriber.punsubscribe(name.as_str()).await?,
                    }
                    Ok::<_, Error>(())
                })
                .await;
            if let Err(e) = released {
                tracing::warn!("Failed to unsubscribe from {}: {}", name, e);
            }
        });
    }
}

pub struct RedisBackend {
    url: StoreUrl,
    pool: Pool,
    subscriber: SubscriberClient,
    channels: Arc<SubscriptionCounts>,
    patterns: Arc<SubscriptionCounts>,
}

impl RedisBackend {
    /// Connect a pool of `pool_size` connections plus one subscriber connection
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self> {
        let parsed = StoreUrl::parse(url)?;
        tracing::info!("Connecting to store at {}", parsed);

        let config = Config::from_url(url)?;
        let policy = ReconnectPolicy::new_exponential(0, 100, 30_000, 2);

        let pool = Builder::from_config(config.clone())
            .set_policy(policy.clone())
            .build_pool(pool_size.max(1))?;
        let subscriber = Builder::from_config(config)
            .set_policy(policy)
            .with_performance_config(|perf| perf.broadcast_channel_capacity = CHANNEL_CAPACITY)
            .build_subscriber_client()?;

        pool.init().await?;
        subscriber.init().await?;
        // Resubscribe to every channel and pattern after a reconnect
        let _ = subscriber.manage_subscriptions();

        tracing::info!("Connected to store at {}", parsed);
        Ok(Self {
            url: parsed,
            pool,
            subscriber,
            channels: Arc::default(),
            patterns: Arc::default(),
        })
    }

    pub fn url(&self) -> &StoreUrl {
        &self.url
    }

    /// Subscribe on the server unless another live stream already did
    async fn retain(&self, kind: SubscriptionKind, name: &str) -> Result<SubscriptionGuard> {
        let counts = match kind {
            SubscriptionKind::Channel => &self.channels,
            SubscriptionKind::Pattern => &self.patterns,
        };
        counts
            .retain(name, || async {
                match kind {
                    SubscriptionKind::Channel => self.subscriber.subscribe(name).await?,
                    SubscriptionKind::Pattern => self.subscriber.psubscribe(name).await?,
                }
                Ok::<_, Error>(())
            })
            .await?;
        Ok(SubscriptionGuard {
            subscriber: self.subscriber.clone(),
            counts: counts.clone(),
            kind,
            name: name.to_string(),
        })
    }

    fn into_channel_message(message: Message) -> Option<ChannelMessage> {
        Some(ChannelMessage {
            channel: message.channel.to_string(),
            payload: message.value.as_string()?,
        })
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("url", &self.url.to_string())
            .finish()
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.pool.next().ping(None).await?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<FieldMap>> {
        let fields: HashMap<String, String> = self.pool.next().hgetall(key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(fields.into_iter().collect()))
    }

    async fn write_versioned(
        &self,
        key: &str,
        fields: &FieldMap,
        condition: WriteCondition,
        now: &str,
    ) -> Result<WriteOutcome> {
        let expected = match condition {
            WriteCondition::Any => String::new(),
            WriteCondition::Version(v) => v.to_string(),
        };

        let mut args = Vec::with_capacity(2 + fields.len() * 2);
        args.push(expected);
        args.push(now.to_string());
        for (name, value) in fields {
            args.push(name.clone());
            args.push(value.clone());
        }

        let reply: Vec<String> = self
            .pool
            .next()
            .eval(WRITE_VERSIONED_SCRIPT, vec![key.to_string()], args)
            .await?;

        parse_write_reply(key, reply)
    }

    async fn delete(&self, key: &str) -> Result<Option<u64>> {
        let version: Option<String> = self
            .pool
            .next()
            .eval(DELETE_SCRIPT, vec![key.to_string()], ())
            .await?;
        Ok(version.map(|v| v.parse().unwrap_or(0)))
    }

    fn scan(&self, pattern: &str) -> KeyPageStream {
        self.pool
            .next()
            .scan(pattern.to_string(), Some(SCAN_PAGE_SIZE), None)
            .map(|page| -> Result<Vec<String>> {
                let mut page = page?;
                let keys = page
                    .take_results()
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|key| key.into_string())
                    .collect();
                let _ = page.next();
                Ok(keys)
            })
            .boxed()
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let _: i64 = self.pool.next().publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        // Receiver first, so nothing published after `subscribe` returns is missed
        let rx = self.subscriber.message_rx();
        let guard = self.retain(SubscriptionKind::Channel, channel).await?;

        let channel = channel.to_string();
        Ok(broadcast_stream(rx, guard, move |message: Message| {
            Self::into_channel_message(message).filter(|m| m.channel == channel)
        }))
    }

    async fn psubscribe(&self, pattern: &str) -> Result<MessageStream> {
        let rx = self.subscriber.message_rx();
        let guard = self.retain(SubscriptionKind::Pattern, pattern).await?;

        let pattern = pattern.to_string();
        Ok(broadcast_stream(rx, guard, move |message: Message| {
            Self::into_channel_message(message).filter(|m| glob_match(&pattern, &m.channel))
        }))
    }
}

/// Decode the Lua script reply
fn parse_write_reply(key: &str, reply: Vec<String>) -> Result<WriteOutcome> {
    let mut items = reply.into_iter();
    match items.next().as_deref() {
        Some("ok") => {
            let version = items
                .next()
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| Error::serialization(key, "write reply missing version"))?;
            let created_at = items
                .next()
                .ok_or_else(|| Error::serialization(key, "write reply missing created_at"))?;

            let mut previous = FieldMap::new();
            while let (Some(name), Some(value)) = (items.next(), items.next()) {
                previous.insert(name, value);
            }
            Ok(WriteOutcome::Written {
                version,
                created_at,
                previous,
            })
        }
        Some("conflict") => {
            let actual = items.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            Ok(WriteOutcome::Conflict { actual })
        }
        Some("corrupt") => Err(Error::serialization(
            key,
            format!(
                "stored version is not an integer: {}",
                items.next().unwrap_or_default()
            ),
        )),
        other => Err(Error::serialization(
            key,
            format!("unexpected write reply: {other:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_ok_reply() {
        let reply = strings(&["ok", "4", "2026-01-01T00:00:00Z", "version", "3", "name", "x"]);
        match parse_write_reply("k", reply).expect("parse") {
            WriteOutcome::Written {
                version,
                created_at,
                previous,
            } => {
                assert_eq!(version, 4);
                assert_eq!(created_at, "2026-01-01T00:00:00Z");
                assert_eq!(previous.get("name").map(String::as_str), Some("x"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_conflict_and_corrupt() {
        assert_eq!(
            parse_write_reply("k", strings(&["conflict", "7"])).expect("parse"),
            WriteOutcome::Conflict { actual: 7 }
        );
        let err = parse_write_reply("k", strings(&["corrupt", "abc"])).unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(parse_write_reply("k", vec![]).is_err());
    }
}
