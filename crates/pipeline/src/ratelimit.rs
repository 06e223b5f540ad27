//! Rate-limiting stages: burst (short window) and requests (long window).
//!
//! Both draw from the same pluggable store and fail with a recoverable
//! `RATE_LIMITED` carrying `Retry-After`.

use manifold_core::context::{RateLimitState, RequestContext};
use manifold_core::error::{ErrorCode, GatewayError};
use manifold_core::store::RateLimitStore;
use manifold_manifest::{Manifest, WindowLimit};

/// Stage 4 — burst limit.
pub async fn burst_limit(
    manifest: &Manifest,
    store: &dyn RateLimitStore,
    ctx: &mut RequestContext,
) -> Result<(), GatewayError> {
    enforce(manifest, store, ctx, "burst", manifest.rate_limits.burst).await
}

/// Stage 5 — window limit.
pub async fn window_limit(
    manifest: &Manifest,
    store: &dyn RateLimitStore,
    ctx: &mut RequestContext,
) -> Result<(), GatewayError> {
    enforce(manifest, store, ctx, "requests", manifest.rate_limits.requests).await
}

async fn enforce(
    manifest: &Manifest,
    store: &dyn RateLimitStore,
    ctx: &mut RequestContext,
    kind: &str,
    limit: WindowLimit,
) -> Result<(), GatewayError> {
    if !manifest.enforcement.rate_limit_required {
        return Ok(());
    }

    let tenant = ctx.tenant_key();
    let key = format!("rl:{tenant}:{kind}");
    let bucket = store.increment(&key, limit.window_ms).await?;

    let remaining = (limit.max as i64) - (bucket.count as i64);
    ctx.rate_limit = Some(RateLimitState {
        remaining: remaining.max(0),
        reset_at_ms: bucket.reset_at_ms,
    });

    if bucket.count > limit.max as u64 {
        let retry_after = retry_after_seconds(bucket.reset_at_ms, limit.window_ms);
        tracing::warn!(tenant = %tenant, kind, count = bucket.count, "Rate limit exceeded");
        return Err(GatewayError::new(
            ErrorCode::RateLimited,
            format!("{kind} rate limit exceeded for tenant {tenant}"),
        )
        .with_retry_after(retry_after));
    }
    Ok(())
}

/// Seconds until the window resets: ceil((reset − now)/1000), at least 1,
/// and never beyond the window length itself.
pub fn retry_after_seconds(reset_at_ms: u64, window_ms: u64) -> u64 {
    let now = chrono::Utc::now().timestamp_millis() as u64;
    let until_reset = reset_at_ms.saturating_sub(now);
    let ceiling = until_reset.div_ceil(1000).max(1);
    ceiling.min(window_ms.div_ceil(1000).max(1))
}
