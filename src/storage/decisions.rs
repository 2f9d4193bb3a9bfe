//! Routing decision persistence.
//!
//! Decisions are append-only; the dispatcher writes them fire-and-forget
//! so a slow or failing database never delays a routing decision.

use sqlx::SqlitePool;

use crate::dispatch::RoutingDecisionRecord;

/// Insert one decision row.
pub async fn insert(pool: &SqlitePool, record: &RoutingDecisionRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO routing_decisions (
            id, timestamp, client_region, selected_providers,
            chosen_provider, confidence, reason
        ) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(record.timestamp.to_rfc3339())
    .bind(&record.client_region)
    .bind(record.selected_providers.join(","))
    .bind(&record.chosen_provider)
    .bind(record.confidence)
    .bind(&record.reason)
    .execute(pool)
    .await?;
    Ok(())
}

/// Spawn a fire-and-forget decision write.
///
/// If the write fails, a warning is logged but the error is not propagated.
pub fn spawn_decision_write(pool: &SqlitePool, record: RoutingDecisionRecord) {
    let pool = pool.clone();
    tokio::spawn(async move {
        if let Err(e) = insert(&pool, &record).await {
            tracing::warn!(
                decision_id = %record.id,
                error = %e,
                "Failed to write routing decision to database"
            );
        }
    });
}

/// Count of persisted decisions, for the check/inspection paths.
pub async fn count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM routing_decisions")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}
