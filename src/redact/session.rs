//! Wires the redaction engine and rehydrator into the plugin interface.
//! Per spec.md §4.4/§4.5: when `reversible` is enabled, redacted requests
//! place placeholders scoped to a session id (falling back to a single
//! anonymous session when the request carries none), and matching
//! responses rehydrate those placeholders back to their originals as SSE
//! bytes stream out.

use super::{redact_value, CompiledPolicy, Stats};
use crate::plugin::{Plugin, RequestContext, ResponseContext};
use crate::rehydrate::StreamRehydrator;
use crate::replacement_map::ReplacementMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const ANONYMOUS_SESSION: &str = "__anonymous__";

/// Eviction sweeps touch every session's last-touched timestamp and are
/// cheap, but spec.md §4.8 caps them at once per minute so a busy proxy
/// isn't taking the sessions lock on every single request just to scan it.
const EVICT_INTERVAL_MS: u64 = 60_000;

struct SessionEntry {
    map: Arc<Mutex<ReplacementMap>>,
    last_touched_ms: u64,
}

pub struct RedactPlugin {
    policy: CompiledPolicy,
    reversible: bool,
    verbose: bool,
    session_ttl_ms: u64,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    rehydrators: Mutex<HashMap<String, StreamRehydrator>>,
    last_evict_ms: AtomicU64,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl RedactPlugin {
    pub fn new(policy: CompiledPolicy, reversible: bool, verbose: bool, session_ttl_ms: u64) -> Self {
        Self {
            policy,
            reversible,
            verbose,
            session_ttl_ms,
            sessions: Mutex::new(HashMap::new()),
            rehydrators: Mutex::new(HashMap::new()),
            last_evict_ms: AtomicU64::new(0),
        }
    }

    fn session_key(session_id: Option<&str>) -> String {
        session_id.unwrap_or(ANONYMOUS_SESSION).to_string()
    }

    fn map_for(&self, session_id: Option<&str>) -> Arc<Mutex<ReplacementMap>> {
        let key = Self::session_key(session_id);
        let mut sessions = self.sessions.lock().unwrap();
        self.evict_expired(&mut sessions);
        let entry = sessions.entry(key).or_insert_with(|| SessionEntry {
            map: Arc::new(Mutex::new(ReplacementMap::new())),
            last_touched_ms: now_ms(),
        });
        entry.last_touched_ms = now_ms();
        entry.map.clone()
    }

    fn evict_expired(&self, sessions: &mut HashMap<String, SessionEntry>) {
        if self.session_ttl_ms == 0 {
            return;
        }
        let now = now_ms();
        let last = self.last_evict_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < EVICT_INTERVAL_MS {
            return;
        }
        self.last_evict_ms.store(now, Ordering::Relaxed);
        sessions.retain(|_, entry| now.saturating_sub(entry.last_touched_ms) < self.session_ttl_ms);
    }
}

impl Plugin for RedactPlugin {
    fn name(&self) -> &str {
        "redact"
    }

    fn has_on_request(&self) -> bool {
        true
    }

    fn has_on_response(&self) -> bool {
        true
    }

    fn has_on_stream_chunk(&self) -> bool {
        self.reversible
    }

    fn has_on_stream_end(&self) -> bool {
        self.reversible
    }

    fn on_request(&self, mut ctx: RequestContext) -> anyhow::Result<RequestContext> {
        let Some(body) = ctx.body.clone() else {
            return Ok(ctx);
        };

        let mut stats = Stats::default();
        let redacted = if self.reversible {
            let map = self.map_for(ctx.session_id.as_deref());
            let mut map_guard = map.lock().unwrap();
            redact_value(&body, &self.policy, &mut stats, Some(&mut map_guard))
        } else {
            redact_value(&body, &self.policy, &mut stats, None)
        };

        if self.verbose && stats.total() > 0 {
            tracing::info!(total = stats.total(), "redacted request fields");
        }

        ctx.body = Some(redacted);
        Ok(ctx)
    }

    /// Non-streaming responses only (streaming ones go through
    /// onStreamChunk/onStreamEnd instead). In reversible mode, the buffered
    /// body is rehydrated in one shot from the session's replacement map —
    /// the incremental SSE transducer in `rehydrate.rs` has no role here,
    /// since there is exactly one complete JSON text to restore placeholders
    /// in. In one-way mode there is no map, so the response body itself is
    /// redacted before reaching the client.
    fn on_response(&self, mut ctx: ResponseContext) -> anyhow::Result<ResponseContext> {
        if self.reversible {
            let map = self.map_for(ctx.session_id.as_deref());
            let map_guard = map.lock().unwrap();
            ctx.body = map_guard.rehydrate(&ctx.body);
            return Ok(ctx);
        }

        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&ctx.body) {
            let mut stats = Stats::default();
            let redacted = redact_value(&value, &self.policy, &mut stats, None);
            if let Ok(text) = serde_json::to_string(&redacted) {
                ctx.body = text;
            }
        }
        Ok(ctx)
    }

    fn on_stream_chunk(&self, bytes: Vec<u8>, session_id: Option<&str>) -> anyhow::Result<Vec<u8>> {
        let key = Self::session_key(session_id);
        let map = self.map_for(session_id);
        let mut rehydrators = self.rehydrators.lock().unwrap();
        let rehydrator = rehydrators
            .entry(key)
            .or_insert_with(|| StreamRehydrator::new(map));
        Ok(rehydrator.on_chunk(&bytes))
    }

    fn on_stream_end(&self, session_id: Option<&str>) -> anyhow::Result<Option<Vec<u8>>> {
        let key = Self::session_key(session_id);
        let mut rehydrators = self.rehydrators.lock().unwrap();
        let Some(rehydrator) = rehydrators.get_mut(&key) else {
            return Ok(None);
        };
        let tail = rehydrator.on_end();
        rehydrators.remove(&key);
        Ok(tail)
    }
}
