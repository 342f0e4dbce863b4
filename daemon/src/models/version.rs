use crate::schema::*;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use wheelhouse_common::errors::*;

#[derive(Identifiable, Queryable, AsChangeset, Clone, PartialEq, Debug)]
#[diesel(table_name = versions)]
pub struct Version {
    pub id: i32,
    pub package_id: i32,
    pub version: String,
    pub released_at: NaiveDateTime,
    pub skip: String,
}

impl Version {
    pub fn get(
        my_package_id: i32,
        my_version: &str,
        connection: &mut SqliteConnection,
    ) -> Result<Option<Version>> {
        use crate::schema::versions::dsl::*;
        let ver = versions
            .filter(package_id.eq(my_package_id))
            .filter(version.eq(my_version))
            .first::<Version>(connection)
            .optional()?;
        Ok(ver)
    }

    pub fn for_package(
        my_package_id: i32,
        connection: &mut SqliteConnection,
    ) -> Result<Vec<Version>> {
        use crate::schema::versions::dsl::*;
        let vers = versions
            .filter(package_id.eq(my_package_id))
            .order_by(released_at.asc())
            .load::<Version>(connection)?;
        Ok(vers)
    }

    /// Every known `(package, version)` pair, for the upstream diff.
    pub fn all(connection: &mut SqliteConnection) -> Result<Vec<(String, String)>> {
        let pairs = versions::table
            .inner_join(packages::table)
            .select((packages::name, versions::version))
            .load::<(String, String)>(connection)?;
        Ok(pairs)
    }

    /// The dispatch queue: versions without a successful build attempt for
    /// the given ABI, oldest release first, package name as tie-break.
    /// Skipped packages and versions are hidden.
    pub fn pending(
        abi: &str,
        limit: i64,
        connection: &mut SqliteConnection,
    ) -> Result<Vec<(String, String)>> {
        use diesel::dsl::{exists, not};
        let pending = versions::table
            .inner_join(packages::table)
            .filter(packages::skip.eq(""))
            .filter(versions::skip.eq(""))
            .filter(not(exists(
                builds::table
                    .filter(builds::version_id.eq(versions::id))
                    .filter(builds::abi_tag.eq(abi))
                    .filter(builds::status.eq(true)),
            )))
            .order((versions::released_at.asc(), packages::name.asc()))
            .limit(limit)
            .select((packages::name, versions::version))
            .load::<(String, String)>(connection)?;
        Ok(pending)
    }

    pub fn set_skip(
        my_package_id: i32,
        my_version: &str,
        reason: &str,
        connection: &mut SqliteConnection,
    ) -> Result<bool> {
        use crate::schema::versions::dsl::*;
        let rows = diesel::update(
            versions
                .filter(package_id.eq(my_package_id))
                .filter(version.eq(my_version)),
        )
        .set(skip.eq(reason))
        .execute(connection)?;
        Ok(rows > 0)
    }
}

#[derive(Insertable, PartialEq, Debug, Clone)]
#[diesel(table_name = versions)]
pub struct NewVersion {
    pub package_id: i32,
    pub version: String,
    pub released_at: NaiveDateTime,
    pub skip: String,
}

impl NewVersion {
    /// Registers the version if it is new; duplicates are a no-op. Adding a
    /// version does not queue a build by itself, the dispatch queue is a
    /// view.
    pub fn insert(&self, connection: &mut SqliteConnection) -> Result<bool> {
        use crate::schema::versions::dsl::*;
        let rows = diesel::insert_into(versions)
            .values(self)
            .on_conflict((package_id, version))
            .do_nothing()
            .execute(connection)?;
        Ok(rows > 0)
    }
}
