//! Canonical light state store
//!
//! Maps light id to its current fields. Reads never touch the bus; writes
//! only happen through the subscription bridge's serialized apply step.
//!
//! Backends:
//! - in-memory `DashMap` for single-process deployments and tests
//! - Redis, one hash per light (`light:{id}`) plus the `lightKeys` set of
//!   registered ids, so the fleet survives a restart. Both keys carry the
//!   configured key prefix and every operation is bounded by the command
//!   timeout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use prysmalight_shared_config::RedisConfig;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::error::{DeviceError, DeviceResult};
use crate::models::{Color, ConnectionStatus, Light, LightPatch, PowerState, NO_EFFECT};

/// Set of every registered light id
const LIGHT_KEYS: &str = "lightKeys";

/// Result of merging a patch into the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Light state after the merge
    pub light: Light,
    /// Fields that actually changed
    pub changes: LightPatch,
    /// Whether the light was created by this merge
    pub created: bool,
}

/// Light store with Redis + in-memory backends
#[derive(Clone)]
pub struct LightRepository {
    inner: Arc<LightRepositoryInner>,
}

enum LightRepositoryInner {
    /// Redis-backed store that survives restarts
    Redis(RedisLightStore),
    /// Process-local store
    InMemory(InMemoryLightStore),
}

impl LightRepository {
    /// Create an in-memory store
    pub fn new_in_memory() -> Self {
        Self {
            inner: Arc::new(LightRepositoryInner::InMemory(InMemoryLightStore::default())),
        }
    }

    /// Create a Redis-backed store
    pub async fn new_with_redis(client: redis::Client, config: &RedisConfig) -> DeviceResult<Self> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            inner: Arc::new(LightRepositoryInner::Redis(RedisLightStore {
                conn,
                keys: KeyLayout::new(config),
                command_timeout: config.command_timeout(),
            })),
        })
    }

    /// Try to create with Redis, fall back to in-memory
    pub async fn try_with_redis(config: &RedisConfig) -> Self {
        match redis::Client::open(config.connection_url()) {
            Ok(client) => match tokio::time::timeout(
                config.connect_timeout(),
                Self::ping(client, config),
            )
            .await
            {
                Ok(Ok(repository)) => {
                    tracing::info!(key_prefix = %config.key_prefix, "Redis light store connected");
                    return repository;
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Redis light store connection failed");
                }
                Err(_) => {
                    tracing::warn!(timeout_secs = config.connect_timeout_secs, "Redis light store connection timed out");
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Redis client creation failed for light store");
            }
        }

        tracing::warn!("Using in-memory light store (state is lost on restart)");
        Self::new_in_memory()
    }

    async fn ping(client: redis::Client, config: &RedisConfig) -> DeviceResult<Self> {
        let repository = Self::new_with_redis(client, config).await?;
        if let LightRepositoryInner::Redis(store) = &*repository.inner {
            let mut conn = store.conn.clone();
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        }
        Ok(repository)
    }

    /// Check if the store persists to Redis
    pub fn is_redis_backed(&self) -> bool {
        matches!(&*self.inner, LightRepositoryInner::Redis(_))
    }

    /// Get one light
    pub async fn get(&self, id: &str) -> DeviceResult<Option<Light>> {
        match &*self.inner {
            LightRepositoryInner::Redis(redis) => redis.timed(redis.get(id)).await,
            LightRepositoryInner::InMemory(memory) => Ok(memory.get(id)),
        }
    }

    /// Get every light, ordered by id
    pub async fn get_all(&self) -> DeviceResult<Vec<Light>> {
        let mut lights = match &*self.inner {
            LightRepositoryInner::Redis(redis) => redis.timed(redis.get_all()).await?,
            LightRepositoryInner::InMemory(memory) => memory.get_all(),
        };
        lights.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(lights)
    }

    /// Check if a light is registered
    pub async fn contains(&self, id: &str) -> DeviceResult<bool> {
        match &*self.inner {
            LightRepositoryInner::Redis(redis) => redis.timed(redis.contains(id)).await,
            LightRepositoryInner::InMemory(memory) => Ok(memory.lights.contains_key(id)),
        }
    }

    /// Every registered id, sorted
    pub async fn ids(&self) -> DeviceResult<Vec<String>> {
        let mut ids = match &*self.inner {
            LightRepositoryInner::Redis(redis) => redis.timed(redis.ids()).await?,
            LightRepositoryInner::InMemory(memory) => {
                memory.lights.iter().map(|e| e.key().clone()).collect()
            }
        };
        ids.sort();
        Ok(ids)
    }

    /// Register a light with default fields, replacing anything stored
    pub async fn insert_default(&self, id: &str) -> DeviceResult<Light> {
        let light = Light::new(id);
        match &*self.inner {
            LightRepositoryInner::Redis(redis) => redis.timed(redis.put(&light)).await?,
            LightRepositoryInner::InMemory(memory) => {
                memory.lights.insert(id.to_string(), light.clone());
            }
        }
        Ok(light)
    }

    /// Merge a patch into a light, creating it with defaults if absent.
    ///
    /// Only changed fields are written and reported.
    pub async fn upsert_fields(&self, id: &str, patch: &LightPatch) -> DeviceResult<MergeOutcome> {
        match &*self.inner {
            LightRepositoryInner::Redis(redis) => redis.timed(redis.upsert_fields(id, patch)).await,
            LightRepositoryInner::InMemory(memory) => Ok(memory.upsert_fields(id, patch)),
        }
    }

    /// Remove a light; returns whether it was registered
    pub async fn remove(&self, id: &str) -> DeviceResult<bool> {
        match &*self.inner {
            LightRepositoryInner::Redis(redis) => redis.timed(redis.remove(id)).await,
            LightRepositoryInner::InMemory(memory) => Ok(memory.lights.remove(id).is_some()),
        }
    }
}

#[derive(Default)]
struct InMemoryLightStore {
    lights: DashMap<String, Light>,
}

impl InMemoryLightStore {
    fn get(&self, id: &str) -> Option<Light> {
        self.lights.get(id).map(|light| light.value().clone())
    }

    fn get_all(&self) -> Vec<Light> {
        self.lights.iter().map(|entry| entry.value().clone()).collect()
    }

    fn upsert_fields(&self, id: &str, patch: &LightPatch) -> MergeOutcome {
        let mut created = false;
        let mut entry = self.lights.entry(id.to_string()).or_insert_with(|| {
            created = true;
            Light::new(id)
        });
        let changes = entry.merge(patch);

        MergeOutcome {
            light: entry.value().clone(),
            changes,
            created,
        }
    }
}

/// Key names under the configured prefix
#[derive(Debug, Clone)]
struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    fn new(config: &RedisConfig) -> Self {
        Self {
            prefix: config.key(""),
        }
    }

    fn light(&self, id: &str) -> String {
        format!("{}light:{}", self.prefix, id)
    }

    fn index(&self) -> String {
        format!("{}{}", self.prefix, LIGHT_KEYS)
    }
}

struct RedisLightStore {
    conn: MultiplexedConnection,
    keys: KeyLayout,
    command_timeout: Duration,
}

impl RedisLightStore {
    /// Bound one store operation by the command timeout
    async fn timed<T>(&self, operation: impl Future<Output = DeviceResult<T>>) -> DeviceResult<T> {
        match tokio::time::timeout(self.command_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Store(redis::RedisError::from(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no answer within {}ms", self.command_timeout.as_millis()),
            )))),
        }
    }

    async fn get(&self, id: &str) -> DeviceResult<Option<Light>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.keys.light(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        light_from_hash(id, &fields).map(Some)
    }

    async fn get_all(&self) -> DeviceResult<Vec<Light>> {
        let mut lights = Vec::new();
        for id in self.ids().await? {
            match self.get(&id).await? {
                Some(light) => lights.push(light),
                None => tracing::warn!(id = %id, "Registered light has no stored state"),
            }
        }
        Ok(lights)
    }

    async fn contains(&self, id: &str) -> DeviceResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(self.keys.index(), id).await?)
    }

    async fn ids(&self) -> DeviceResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(self.keys.index()).await?)
    }

    async fn put(&self, light: &Light) -> DeviceResult<()> {
        let mut conn = self.conn.clone();
        let key = self.keys.light(&light.id);
        let fields = patch_to_hash(&LightPatch::from(light));

        redis::pipe()
            .atomic()
            .del(&key)
            .ignore()
            .hset_multiple(&key, &fields[..])
            .ignore()
            .sadd(self.keys.index(), &light.id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn upsert_fields(&self, id: &str, patch: &LightPatch) -> DeviceResult<MergeOutcome> {
        let (mut light, created) = match self.get(id).await? {
            Some(light) => (light, false),
            None => (Light::new(id), true),
        };
        let changes = light.merge(patch);

        if created {
            self.put(&light).await?;
        } else if !changes.is_empty() {
            let mut conn = self.conn.clone();
            let fields = patch_to_hash(&changes);
            let _: () = conn.hset_multiple(self.keys.light(id), &fields[..]).await?;
        }

        Ok(MergeOutcome {
            light,
            changes,
            created,
        })
    }

    async fn remove(&self, id: &str) -> DeviceResult<bool> {
        let mut conn = self.conn.clone();
        let (_, removed): (i64, i64) = redis::pipe()
            .atomic()
            .del(self.keys.light(id))
            .srem(self.keys.index(), id)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}

/// Hash fields for every field present in a patch
fn patch_to_hash(patch: &LightPatch) -> Vec<(&'static str, String)> {
    let mut fields = Vec::new();
    if let Some(connected) = patch.connected {
        fields.push(("connected", u8::from(connected).to_string()));
    }
    if let Some(state) = patch.state {
        fields.push(("state", state.to_string()));
    }
    if let Some(brightness) = patch.brightness {
        fields.push(("brightness", brightness.to_string()));
    }
    if let Some(color) = patch.color {
        fields.push(("color:red", color.r.to_string()));
        fields.push(("color:green", color.g.to_string()));
        fields.push(("color:blue", color.b.to_string()));
    }
    if let Some(effect) = &patch.effect {
        fields.push(("effect", effect.clone()));
    }
    if let Some(speed) = patch.speed {
        fields.push(("speed", speed.to_string()));
    }
    if let Some(effects) = &patch.supported_effects {
        let encoded = serde_json::to_string(effects).unwrap_or_else(|_| "[]".to_string());
        fields.push(("supportedEffects", encoded));
    }
    fields
}

/// Decode a stored hash; absent fields keep their defaults
fn light_from_hash(id: &str, fields: &HashMap<String, String>) -> DeviceResult<Light> {
    let corrupt = |field: &str, value: &str| DeviceError::CorruptState {
        id: id.to_string(),
        reason: format!("bad {} value '{}'", field, value),
    };
    let number = |field: &str| -> DeviceResult<Option<u8>> {
        fields
            .get(field)
            .map(|v| v.parse::<u8>().map_err(|_| corrupt(field, v)))
            .transpose()
    };

    let mut light = Light::new(id);

    if let Some(value) = number("connected")? {
        light.connected =
            ConnectionStatus::try_from(value).map_err(|_| corrupt("connected", &value.to_string()))?;
    }
    if let Some(value) = fields.get("state") {
        light.state = match value.as_str() {
            "ON" => PowerState::On,
            "OFF" => PowerState::Off,
            other => return Err(corrupt("state", other)),
        };
    }
    if let Some(brightness) = number("brightness")? {
        light.brightness = brightness;
    }
    let default_color = light.color;
    light.color = Color::new(
        number("color:red")?.unwrap_or(default_color.r),
        number("color:green")?.unwrap_or(default_color.g),
        number("color:blue")?.unwrap_or(default_color.b),
    );
    if let Some(effect) = fields.get("effect") {
        light.effect = (effect != NO_EFFECT).then(|| effect.clone());
    }
    if let Some(speed) = number("speed")? {
        light.speed = speed;
    }
    if let Some(effects) = fields.get("supportedEffects") {
        light.supported_effects =
            serde_json::from_str(effects).map_err(|_| corrupt("supportedEffects", effects))?;
    }

    Ok(light)
}
