//! Housekeeping sweeps
//!
//! Periodic background jobs dispatched on the `housekeeping` queue:
//! archiving artifacts past the retention policy, expiring stale pending
//! approvals and pruning the dedupe set. Entities are archived, never
//! deleted.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use graphstore::{DedupeStore, GraphDriver, NodeLabel, ReadQuery, StatusGuard, UpsertSpec};
use serde_json::json;
use std::time::Duration;

/// Id of the single retention policy node
pub const RETENTION_POLICY_ID: &str = "retention_policy:default";

/// How long dedupe entries are kept (days)
const DEDUPE_RETENTION_DAYS: i64 = 14;

/// Seed the retention policy node when absent.
pub async fn seed_retention_policy(
    driver: &GraphDriver,
    artifact_max_age_days: u32,
) -> graphstore::Result<()> {
    if driver
        .get_node(NodeLabel::RetentionPolicy, RETENTION_POLICY_ID)
        .await?
        .is_some()
    {
        return Ok(());
    }

    driver
        .upsert(
            &UpsertSpec::new(NodeLabel::RetentionPolicy, RETENTION_POLICY_ID).with_props(json!({
                "artifact_max_age_days": artifact_max_age_days,
                "created_ts": Utc::now().to_rfc3339(),
            })),
        )
        .await
}

/// Archive artifacts older than the retention policy allows.
///
/// Returns how many artifacts were archived on this pass.
pub async fn retention_sweep(driver: &GraphDriver) -> graphstore::Result<u64> {
    let max_age_days = driver
        .get_node(NodeLabel::RetentionPolicy, RETENTION_POLICY_ID)
        .await?
        .and_then(|node| node.prop_f64("artifact_max_age_days"))
        .unwrap_or(30.0) as i64;

    let cutoff = Utc::now() - ChronoDuration::days(max_age_days);
    let artifacts = driver.read(&ReadQuery::label(NodeLabel::Artifact)).await?;

    let mut archived = 0;
    for artifact in artifacts {
        if artifact.props.get("archived") == Some(&json!(true)) {
            continue;
        }
        let Some(ts) = artifact.prop_str("ts").and_then(parse_ts) else {
            continue;
        };
        if ts < cutoff {
            driver
                .upsert(
                    &UpsertSpec::new(NodeLabel::Artifact, &artifact.id).with_props(json!({
                        "archived": true,
                        "archived_ts": Utc::now().to_rfc3339(),
                    })),
                )
                .await?;
            archived += 1;
        }
    }

    if archived > 0 {
        tracing::info!("Retention sweep archived {} artifacts", archived);
    }
    Ok(archived)
}

/// Expire pending approvals older than the TTL.
///
/// The status guard makes this a no-op for approvals that were resolved in
/// the meantime.
pub async fn expire_stale_approvals(
    driver: &GraphDriver,
    ttl: Duration,
) -> graphstore::Result<u64> {
    let cutoff = Utc::now() - ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::hours(1));
    let pending = driver
        .read(&ReadQuery::label(NodeLabel::Approval).with_prop("status", json!("pending")))
        .await?;

    let guard = StatusGuard::on_status(&[("pending", &["approved", "rejected", "expired"])]);

    let mut expired = 0;
    for approval in pending {
        let Some(requested) = approval.prop_str("requested_ts").and_then(parse_ts) else {
            continue;
        };
        if requested < cutoff {
            driver
                .upsert(
                    &UpsertSpec::new(NodeLabel::Approval, &approval.id)
                        .with_props(json!({
                            "status": "expired",
                            "resolved_by": "housekeeping",
                            "resolved_ts": Utc::now().to_rfc3339(),
                        }))
                        .with_guard(guard.clone()),
                )
                .await?;
            expired += 1;
        }
    }

    Ok(expired)
}

/// Prune old dedupe entries.
pub async fn prune_dedupe(dedupe: &DedupeStore) -> graphstore::Result<u64> {
    dedupe
        .prune_older_than(DEDUPE_RETENTION_DAYS * 24 * 3600 * 1000)
        .await
}

fn parse_ts(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn driver() -> Arc<GraphDriver> {
        Arc::new(
            GraphDriver::connect_with_max_connections("sqlite::memory:", 1)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_seed_retention_policy_once() {
        let driver = driver().await;

        seed_retention_policy(&driver, 30).await.unwrap();
        seed_retention_policy(&driver, 90).await.unwrap();

        let node = driver
            .get_node(NodeLabel::RetentionPolicy, RETENTION_POLICY_ID)
            .await
            .unwrap()
            .unwrap();
        // Second seed must not overwrite the existing policy.
        assert_eq!(node.prop_f64("artifact_max_age_days"), Some(30.0));
    }

    #[tokio::test]
    async fn test_old_artifacts_archived_not_deleted() {
        let driver = driver().await;
        seed_retention_policy(&driver, 30).await.unwrap();

        let old_ts = (Utc::now() - ChronoDuration::days(45)).to_rfc3339();
        let new_ts = Utc::now().to_rfc3339();
        driver
            .upsert(
                &UpsertSpec::new(NodeLabel::Artifact, "old")
                    .with_props(json!({"kind": "report", "ts": old_ts})),
            )
            .await
            .unwrap();
        driver
            .upsert(
                &UpsertSpec::new(NodeLabel::Artifact, "fresh")
                    .with_props(json!({"kind": "report", "ts": new_ts})),
            )
            .await
            .unwrap();

        let archived = retention_sweep(&driver).await.unwrap();
        assert_eq!(archived, 1);

        let old = driver.get_node(NodeLabel::Artifact, "old").await.unwrap().unwrap();
        assert_eq!(old.props["archived"], json!(true));
        // The node still exists.
        let fresh = driver.get_node(NodeLabel::Artifact, "fresh").await.unwrap().unwrap();
        assert!(fresh.props.get("archived").is_none());

        // A second sweep finds nothing new.
        assert_eq!(retention_sweep(&driver).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_pending_approvals_expire_once() {
        let driver = driver().await;

        let stale_ts = (Utc::now() - ChronoDuration::hours(3)).to_rfc3339();
        driver
            .upsert(
                &UpsertSpec::new(NodeLabel::Approval, "a1")
                    .with_props(json!({"status": "pending", "requested_ts": stale_ts})),
            )
            .await
            .unwrap();

        let expired = expire_stale_approvals(&driver, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(expired, 1);

        let approval = driver.get_node(NodeLabel::Approval, "a1").await.unwrap().unwrap();
        assert_eq!(approval.prop_str("status"), Some("expired"));

        // A resolved approval is not touched again.
        let expired = expire_stale_approvals(&driver, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(expired, 0);
    }

    #[tokio::test]
    async fn test_resolved_approval_not_expired() {
        let driver = driver().await;

        let stale_ts = (Utc::now() - ChronoDuration::hours(3)).to_rfc3339();
        driver
            .upsert(
                &UpsertSpec::new(NodeLabel::Approval, "a1")
                    .with_props(json!({"status": "approved", "requested_ts": stale_ts})),
            )
            .await
            .unwrap();

        let expired = expire_stale_approvals(&driver, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(expired, 0);
    }
}
