use crate::schema::*;
use chrono::{Duration, Utc};
use diesel::dsl::{count_star, sql};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable};
use wheelhouse_common::api::StatsSnapshot;
use wheelhouse_common::errors::*;

/// Rolls up the counters broadcast to monitors. Download counts are derived
/// here on read; the downloads table itself stays append-only.
pub fn collect_statistics(connection: &mut SqliteConnection) -> Result<StatsSnapshot> {
    let packages_count = packages::table
        .select(count_star())
        .first::<i64>(connection)?;
    let packages_skipped = packages::table
        .filter(packages::skip.ne(""))
        .select(count_star())
        .first::<i64>(connection)?;
    let versions_count = versions::table
        .select(count_star())
        .first::<i64>(connection)?;
    let versions_skipped = versions::table
        .filter(versions::skip.ne(""))
        .select(count_star())
        .first::<i64>(connection)?;
    let builds_count = builds::table.select(count_star()).first::<i64>(connection)?;
    let builds_succeeded = builds::table
        .filter(builds::status.eq(true))
        .select(count_star())
        .first::<i64>(connection)?;
    let builds_failed = builds_count - builds_succeeded;
    let build_ms_total = builds::table
        .select(sql::<Nullable<BigInt>>("SUM(duration_ms)"))
        .first::<Option<i64>>(connection)?
        .unwrap_or(0);
    let files_count = files::table.select(count_star()).first::<i64>(connection)?;
    let files_bytes = files::table
        .select(sql::<Nullable<BigInt>>("SUM(filesize)"))
        .first::<Option<i64>>(connection)?
        .unwrap_or(0);
    let downloads_count = downloads::table
        .select(count_star())
        .first::<i64>(connection)?;
    let month_ago = Utc::now().naive_utc() - Duration::days(30);
    let downloads_last_month = downloads::table
        .filter(downloads::accessed_at.gt(month_ago))
        .select(count_star())
        .first::<i64>(connection)?;

    Ok(StatsSnapshot {
        packages_count,
        packages_skipped,
        versions_count,
        versions_skipped,
        builds_count,
        builds_succeeded,
        builds_failed,
        build_ms_total,
        files_count,
        files_bytes,
        downloads_count,
        downloads_last_month,
    })
}
