//! Status store
//!
//! Reads and transitions the status column group of every enrichment
//! dimension. Each transition is a single conditional UPDATE whose WHERE
//! clause names the expected current status, so a concurrent writer (another
//! cycle, an analyzer, an operator) makes it a no-op instead of clobbering.
//! Functions returning `bool` report whether the row actually moved.

use cadenza_common::events::{EnrichmentPhase, PhaseCounts};
use cadenza_common::time;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::time::Duration;

use crate::error::{truncate_error, EnrichResult};
use crate::models::{EnrichmentStatus, StatusDimension, Subject};

fn select_subjects(dim: &StatusDimension) -> String {
    format!(
        "SELECT guid AS id, {name} AS name, {ext} AS external_id, {aux} AS aux, \
                {status} AS status, {retry} AS retry_count, {error} AS last_error \
         FROM {table}",
        name = dim.name_expr,
        ext = dim.external_expr,
        aux = dim.aux_expr,
        status = dim.status_col(),
        retry = dim.retry_col(),
        error = dim.error_col(),
        table = dim.table,
    )
}

fn status_list(statuses: &[EnrichmentStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn subject_from_row(dim: &StatusDimension, row: &SqliteRow) -> EnrichResult<Subject> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<EnrichmentStatus>()
        .map_err(cadenza_common::Error::Internal)?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let name: Option<String> = row.try_get("name")?;

    Ok(Subject {
        id: row.try_get("id")?,
        entity_type: dim.entity_type,
        name: name.unwrap_or_default(),
        external_id: row.try_get("external_id")?,
        aux: row.try_get("aux")?,
        status,
        retry_count: u32::try_from(retry_count.max(0)).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
    })
}

/// Load one subject's view of a phase
pub async fn get_subject(
    pool: &SqlitePool,
    phase: EnrichmentPhase,
    id: &str,
) -> EnrichResult<Option<Subject>> {
    let dim = StatusDimension::of(phase);
    let sql = format!("{} WHERE guid = ?", select_subjects(&dim));

    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.map(|r| subject_from_row(&dim, &r)).transpose()
}

/// Subjects eligible for a phase, newest first
///
/// `max_retries` excludes subjects that already used up their attempts.
pub async fn fetch_eligible(
    pool: &SqlitePool,
    phase: EnrichmentPhase,
    statuses: &[EnrichmentStatus],
    max_retries: Option<u32>,
    limit: usize,
) -> EnrichResult<Vec<Subject>> {
    let dim = StatusDimension::of(phase);
    let retry_clause = match max_retries {
        Some(max) => format!(" AND {} < {}", dim.retry_col(), max),
        None => String::new(),
    };
    let sql = format!(
        "{} WHERE {} IN ({}){} ORDER BY created_at DESC, rowid DESC LIMIT ?",
        select_subjects(&dim),
        dim.status_col(),
        status_list(statuses),
        retry_clause,
    );

    let rows = sqlx::query(&sql)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;

    rows.iter().map(|r| subject_from_row(&dim, r)).collect()
}

/// Move a subject from one of `from` to `processing`, stamping the start time
pub async fn claim(
    pool: &SqlitePool,
    phase: EnrichmentPhase,
    id: &str,
    from: &[EnrichmentStatus],
) -> EnrichResult<bool> {
    let dim = StatusDimension::of(phase);
    let sql = format!(
        "UPDATE {table} SET {status} = 'processing', {started} = ?, {updated} = ? \
         WHERE guid = ? AND {status} IN ({from})",
        table = dim.table,
        status = dim.status_col(),
        started = dim.started_col(),
        updated = dim.updated_col(),
        from = status_list(from),
    );
    let now = time::now();

    let result = sqlx::query(&sql)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// `processing -> completed`, clearing any stored error
pub async fn complete(pool: &SqlitePool, phase: EnrichmentPhase, id: &str) -> EnrichResult<bool> {
    let dim = StatusDimension::of(phase);
    let sql = format!(
        "UPDATE {table} SET {status} = 'completed', {error} = NULL, {updated} = ? \
         WHERE guid = ? AND {status} = 'processing'",
        table = dim.table,
        status = dim.status_col(),
        error = dim.error_col(),
        updated = dim.updated_col(),
    );

    let result = sqlx::query(&sql)
        .bind(time::now())
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// `processing -> pending` after a failed attempt
///
/// `retry_count` is written as given so callers decide whether the attempt
/// counts.
pub async fn release(
    pool: &SqlitePool,
    phase: EnrichmentPhase,
    id: &str,
    retry_count: u32,
    error: &str,
) -> EnrichResult<bool> {
    transition_from_processing(pool, phase, id, EnrichmentStatus::Pending, retry_count, error)
        .await
}

/// `processing -> failed` (terminal until an operator reset)
pub async fn fail(
    pool: &SqlitePool,
    phase: EnrichmentPhase,
    id: &str,
    retry_count: u32,
    error: &str,
) -> EnrichResult<bool> {
    transition_from_processing(pool, phase, id, EnrichmentStatus::Failed, retry_count, error).await
}

async fn transition_from_processing(
    pool: &SqlitePool,
    phase: EnrichmentPhase,
    id: &str,
    to: EnrichmentStatus,
    retry_count: u32,
    error: &str,
) -> EnrichResult<bool> {
    debug_assert!(EnrichmentStatus::Processing.can_transition_to(to));

    let dim = StatusDimension::of(phase);
    let sql = format!(
        "UPDATE {table} SET {status} = ?, {retry} = ?, {error} = ?, {updated} = ? \
         WHERE guid = ? AND {status} = 'processing'",
        table = dim.table,
        status = dim.status_col(),
        retry = dim.retry_col(),
        error = dim.error_col(),
        updated = dim.updated_col(),
    );

    let result = sqlx::query(&sql)
        .bind(to.as_str())
        .bind(i64::from(retry_count))
        .bind(truncate_error(error))
        .bind(time::now())
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Subjects stuck in `processing` since before `cutoff`
///
/// A subject with no start stamp falls back to its last update time.
pub async fn find_stale(
    pool: &SqlitePool,
    phase: EnrichmentPhase,
    cutoff: DateTime<Utc>,
) -> EnrichResult<Vec<Subject>> {
    let dim = StatusDimension::of(phase);
    let sql = format!(
        "{select} WHERE {status} = 'processing' \
         AND julianday(COALESCE({started}, {updated}, created_at)) < julianday(?) \
         ORDER BY rowid",
        select = select_subjects(&dim),
        status = dim.status_col(),
        started = dim.started_col(),
        updated = dim.updated_col(),
    );

    let rows = sqlx::query(&sql).bind(cutoff).fetch_all(pool).await?;
    rows.iter().map(|r| subject_from_row(&dim, r)).collect()
}

/// Whether the analyzer already wrote its result row for a subject
pub async fn artifact_exists(
    pool: &SqlitePool,
    phase: EnrichmentPhase,
    id: &str,
) -> EnrichResult<bool> {
    let Some(table) = StatusDimension::of(phase).artifact_table else {
        return Ok(false);
    };
    let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE track_id = ?)", table);

    let exists: bool = sqlx::query_scalar(&sql).bind(id).fetch_one(pool).await?;
    Ok(exists)
}

/// Status counters for one phase
pub async fn count_by_status(pool: &SqlitePool, phase: EnrichmentPhase) -> EnrichResult<PhaseCounts> {
    let dim = StatusDimension::of(phase);
    let sql = format!(
        "SELECT {status} AS status, COUNT(*) AS n FROM {table} GROUP BY {status}",
        status = dim.status_col(),
        table = dim.table,
    );

    let mut counts = PhaseCounts::default();
    for row in sqlx::query(&sql).fetch_all(pool).await? {
        let status: String = row.try_get("status")?;
        let n: i64 = row.try_get("n")?;
        let n = n.max(0) as u64;
        match status.parse::<EnrichmentStatus>() {
            Ok(EnrichmentStatus::Pending) => counts.pending = n,
            Ok(EnrichmentStatus::Processing) => counts.processing = n,
            Ok(EnrichmentStatus::Completed) => counts.completed = n,
            Ok(EnrichmentStatus::Failed) => counts.failed = n,
            Err(_) => {}
        }
        counts.total += n;
    }

    Ok(counts)
}

/// Subjects the phase would still pick up, plus those in flight
pub async fn count_actionable(
    pool: &SqlitePool,
    phase: EnrichmentPhase,
    claimable: &[EnrichmentStatus],
    max_retries: Option<u32>,
) -> EnrichResult<u64> {
    let dim = StatusDimension::of(phase);
    let retry_clause = match max_retries {
        Some(max) => format!(" AND {} < {}", dim.retry_col(), max),
        None => String::new(),
    };
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE ({} = 'processing' OR {} IN ({})){}",
        dim.table,
        dim.status_col(),
        dim.status_col(),
        status_list(claimable),
        retry_clause,
    );

    let n: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
    Ok(n.max(0) as u64)
}

fn due_clause(dim: &StatusDimension, max_retries: Option<u32>) -> String {
    let retry_clause = match max_retries {
        Some(max) => format!(" AND {} < {}", dim.retry_col(), max),
        None => String::new(),
    };
    format!(
        "(({status} = 'pending'{retry}) OR ({status} = 'completed' \
         AND julianday(COALESCE({updated}, created_at)) < julianday(?)))",
        status = dim.status_col(),
        retry = retry_clause,
        updated = dim.updated_col(),
    )
}

/// Pending subjects plus completed ones last updated longer ago than `age`,
/// newest first
///
/// Used by phases that redo their work periodically. The retry budget only
/// applies to pending subjects.
pub async fn fetch_due(
    pool: &SqlitePool,
    phase: EnrichmentPhase,
    age: Duration,
    max_retries: Option<u32>,
    limit: usize,
) -> EnrichResult<Vec<Subject>> {
    let dim = StatusDimension::of(phase);
    let sql = format!(
        "{} WHERE {} ORDER BY created_at DESC, rowid DESC LIMIT ?",
        select_subjects(&dim),
        due_clause(&dim, max_retries),
    );

    let rows = sqlx::query(&sql)
        .bind(time::ago(age))
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;

    rows.iter().map(|r| subject_from_row(&dim, r)).collect()
}

/// Claim a subject that is pending, or completed and due again
///
/// A claim from `completed` starts a fresh retry budget. A subject refreshed
/// by someone else since it was fetched is no longer due and stays put.
pub async fn claim_due(
    pool: &SqlitePool,
    phase: EnrichmentPhase,
    id: &str,
    age: Duration,
) -> EnrichResult<bool> {
    let dim = StatusDimension::of(phase);
    let sql = format!(
        "UPDATE {table} SET \
             {retry} = CASE WHEN {status} = 'completed' THEN 0 ELSE {retry} END, \
             {status} = 'processing', {started} = ?, {updated} = ? \
         WHERE guid = ? AND {due}",
        table = dim.table,
        retry = dim.retry_col(),
        status = dim.status_col(),
        started = dim.started_col(),
        updated = dim.updated_col(),
        due = due_clause(&dim, None),
    );
    let now = time::now();

    let result = sqlx::query(&sql)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(time::ago(age))
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Operator reset: every `failed` subject (and every parked `pending` one)
/// goes back to `pending` with a fresh retry budget
///
/// Runs in one transaction so a reader never sees a half-reset phase.
pub async fn reset_failed(pool: &SqlitePool, phase: EnrichmentPhase) -> EnrichResult<u64> {
    let dim = StatusDimension::of(phase);
    let mut tx = pool.begin().await?;

    let reset_failed = format!(
        "UPDATE {table} SET {status} = 'pending', {retry} = 0, {error} = NULL, {updated} = ? \
         WHERE {status} = 'failed'",
        table = dim.table,
        status = dim.status_col(),
        retry = dim.retry_col(),
        error = dim.error_col(),
        updated = dim.updated_col(),
    );
    let failed = sqlx::query(&reset_failed)
        .bind(time::now())
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let reset_parked = format!(
        "UPDATE {table} SET {retry} = 0, {updated} = ? \
         WHERE {status} = 'pending' AND {retry} > 0",
        table = dim.table,
        status = dim.status_col(),
        retry = dim.retry_col(),
        updated = dim.updated_col(),
    );
    let parked = sqlx::query(&reset_parked)
        .bind(time::now())
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;
    Ok(failed + parked)
}
