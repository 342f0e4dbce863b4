use crate::models::{last_insert_rowid, File, Package};
use crate::schema::*;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::Serialize;
use wheelhouse_common::errors::*;

#[derive(Identifiable, Queryable, Clone, PartialEq, Debug)]
#[diesel(table_name = builds)]
pub struct Build {
    pub id: i32,
    pub version_id: i32,
    pub abi_tag: String,
    pub built_by: Option<String>,
    pub duration_ms: i64,
    pub status: bool,
    pub started_at: NaiveDateTime,
    pub build_log: String,
}

impl Build {
    pub fn get_id(my_id: i32, connection: &mut SqliteConnection) -> Result<Option<Build>> {
        use crate::schema::builds::dsl::*;
        let build = builds
            .filter(id.eq(my_id))
            .first::<Build>(connection)
            .optional()?;
        Ok(build)
    }

    pub fn detail(my_id: i32, connection: &mut SqliteConnection) -> Result<Option<BuildDetail>> {
        let build = match Build::get_id(my_id, connection)? {
            Some(build) => build,
            None => return Ok(None),
        };
        let (package, version) = builds::table
            .inner_join(versions::table.inner_join(packages::table))
            .filter(builds::id.eq(my_id))
            .select((packages::name, versions::version))
            .first::<(String, String)>(connection)?;
        let files = File::for_build(my_id, connection)?
            .into_iter()
            .map(|file| file.filename)
            .collect();
        Ok(Some(BuildDetail {
            id: build.id,
            package,
            version,
            abi_tag: build.abi_tag,
            built_by: build.built_by,
            duration_ms: build.duration_ms,
            status: build.status,
            started_at: build.started_at,
            build_log: build.build_log,
            files,
        }))
    }

    /// Removes a build attempt. Files and dependencies go with it (cascade);
    /// the caller gets the filenames so the artifacts can be unlinked from
    /// disk, plus whether the package still has any files at all.
    pub fn delete(
        my_id: i32,
        connection: &mut SqliteConnection,
    ) -> Result<Option<DeletedBuild>> {
        let detail = match Build::detail(my_id, connection)? {
            Some(detail) => detail,
            None => return Ok(None),
        };
        {
            use crate::schema::builds::dsl::*;
            diesel::delete(builds.filter(id.eq(my_id))).execute(connection)?;
        }
        let package_has_files = Package::has_files(&detail.package, connection)?;
        Ok(Some(DeletedBuild {
            package: detail.package,
            version: detail.version,
            filenames: detail.files,
            package_has_files,
        }))
    }
}

/// A build attempt joined with its package context, for the control surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildDetail {
    pub id: i32,
    pub package: String,
    pub version: String,
    pub abi_tag: String,
    pub built_by: Option<String>,
    pub duration_ms: i64,
    pub status: bool,
    pub started_at: NaiveDateTime,
    pub build_log: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeletedBuild {
    pub package: String,
    pub version: String,
    pub filenames: Vec<String>,
    pub package_has_files: bool,
}

#[derive(Insertable, PartialEq, Debug, Clone)]
#[diesel(table_name = builds)]
pub struct NewBuild {
    pub version_id: i32,
    pub abi_tag: String,
    pub built_by: Option<String>,
    pub duration_ms: i64,
    pub status: bool,
    pub started_at: NaiveDateTime,
    pub build_log: String,
}

impl NewBuild {
    pub fn insert(&self, connection: &mut SqliteConnection) -> Result<i32> {
        diesel::insert_into(builds::table)
            .values(self)
            .execute(connection)?;

        let rows = diesel::select(last_insert_rowid()).load::<i32>(connection)?;
        if let Some(id) = rows.first() {
            Ok(*id)
        } else {
            bail!("Failed to get last_insert_rowid")
        }
    }
}
