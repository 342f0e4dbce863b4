use crate::schema::*;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use wheelhouse_common::errors::*;

#[derive(Identifiable, Queryable, AsChangeset, Clone, PartialEq, Debug)]
#[diesel(table_name = packages)]
pub struct Package {
    pub id: i32,
    pub name: String,
    pub skip: String,
    pub added_at: NaiveDateTime,
}

impl Package {
    pub fn get(my_name: &str, connection: &mut SqliteConnection) -> Result<Option<Package>> {
        use crate::schema::packages::dsl::*;
        let pkg = packages
            .filter(name.eq(my_name))
            .first::<Package>(connection)
            .optional()?;
        Ok(pkg)
    }

    pub fn get_id(my_id: i32, connection: &mut SqliteConnection) -> Result<Package> {
        use crate::schema::packages::dsl::*;
        let pkg = packages.filter(id.eq(my_id)).first::<Package>(connection)?;
        Ok(pkg)
    }

    pub fn list_names(connection: &mut SqliteConnection) -> Result<Vec<String>> {
        use crate::schema::packages::dsl::*;
        let names = packages
            .select(name)
            .order_by(name)
            .load::<String>(connection)?;
        Ok(names)
    }

    /// Packages that belong on the root index: at least one file, not
    /// skipped.
    pub fn root_listing(connection: &mut SqliteConnection) -> Result<Vec<String>> {
        let names = packages::table
            .inner_join(versions::table.inner_join(builds::table.inner_join(files::table)))
            .filter(packages::skip.eq(""))
            .select(packages::name)
            .distinct()
            .order_by(packages::name.asc())
            .load::<String>(connection)?;
        Ok(names)
    }

    pub fn has_files(my_name: &str, connection: &mut SqliteConnection) -> Result<bool> {
        use diesel::dsl::{exists, select};
        let found = select(exists(
            packages::table
                .inner_join(versions::table.inner_join(builds::table.inner_join(files::table)))
                .filter(packages::name.eq(my_name)),
        ))
        .get_result::<bool>(connection)?;
        Ok(found)
    }

    /// Sets the skip reason; the empty string makes the package buildable
    /// again. Returns false if the package is unknown.
    pub fn set_skip(
        my_name: &str,
        reason: &str,
        connection: &mut SqliteConnection,
    ) -> Result<bool> {
        use crate::schema::packages::dsl::*;
        let rows = diesel::update(packages.filter(name.eq(my_name)))
            .set(skip.eq(reason))
            .execute(connection)?;
        Ok(rows > 0)
    }
}

#[derive(Insertable, PartialEq, Debug, Clone)]
#[diesel(table_name = packages)]
pub struct NewPackage {
    pub name: String,
    pub skip: String,
    pub added_at: NaiveDateTime,
}

impl NewPackage {
    pub fn new(name: String, skip: String, added_at: NaiveDateTime) -> NewPackage {
        NewPackage {
            name,
            skip,
            added_at,
        }
    }

    /// Registers the package if it is new. Re-registering is a no-op, which
    /// keeps the operation safe to retry.
    pub fn insert(&self, connection: &mut SqliteConnection) -> Result<bool> {
        use crate::schema::packages::dsl::*;
        let rows = diesel::insert_into(packages)
            .values(self)
            .on_conflict(name)
            .do_nothing()
            .execute(connection)?;
        Ok(rows > 0)
    }
}
