use crate::schema::*;
use diesel::prelude::*;
use serde::Serialize;
use wheelhouse_common::errors::*;
use wheelhouse_common::{Dependency, WheelFile};

#[derive(Identifiable, Queryable, Selectable, Insertable, Clone, PartialEq, Debug, Serialize)]
#[diesel(table_name = files)]
#[diesel(primary_key(filename))]
pub struct File {
    pub filename: String,
    pub build_id: i32,
    pub filesize: i64,
    pub filehash: String,
    pub package_tag: String,
    pub package_version_tag: String,
    pub py_version_tag: String,
    pub abi_tag: String,
    pub platform_tag: String,
}

impl File {
    pub fn from_wheel(wheel: &WheelFile, build_id: i32) -> File {
        File {
            filename: wheel.filename.clone(),
            build_id,
            filesize: wheel.filesize as i64,
            filehash: wheel.filehash.clone(),
            package_tag: wheel.tags.package_tag.clone(),
            package_version_tag: wheel.tags.package_version_tag.clone(),
            py_version_tag: wheel.tags.py_version_tag.clone(),
            abi_tag: wheel.tags.abi_tag.clone(),
            platform_tag: wheel.tags.platform_tag.clone(),
        }
    }

    pub fn get(my_filename: &str, connection: &mut SqliteConnection) -> Result<Option<File>> {
        use crate::schema::files::dsl::*;
        let file = files
            .filter(filename.eq(my_filename))
            .first::<File>(connection)
            .optional()?;
        Ok(file)
    }

    /// Every file of a package, for the package index page. The build-files
    /// invariant means every row here came from a successful attempt.
    pub fn for_package(
        my_package: &str,
        connection: &mut SqliteConnection,
    ) -> Result<Vec<File>> {
        let rows = files::table
            .inner_join(builds::table.inner_join(versions::table.inner_join(packages::table)))
            .filter(packages::name.eq(my_package))
            .order_by(files::filename.asc())
            .select(File::as_select())
            .load::<File>(connection)?;
        Ok(rows)
    }

    pub fn for_build(my_build_id: i32, connection: &mut SqliteConnection) -> Result<Vec<File>> {
        use crate::schema::files::dsl::*;
        let rows = files
            .filter(build_id.eq(my_build_id))
            .order_by(filename.asc())
            .load::<File>(connection)?;
        Ok(rows)
    }

    pub fn for_version(
        my_version_id: i32,
        connection: &mut SqliteConnection,
    ) -> Result<Vec<File>> {
        let rows = files::table
            .inner_join(builds::table)
            .filter(builds::version_id.eq(my_version_id))
            .order_by(files::filename.asc())
            .select(File::as_select())
            .load::<File>(connection)?;
        Ok(rows)
    }

    pub fn insert(&self, connection: &mut SqliteConnection) -> Result<()> {
        diesel::insert_into(files::table)
            .values(self)
            .execute(connection)?;
        Ok(())
    }
}

#[derive(Insertable, PartialEq, Debug, Clone)]
#[diesel(table_name = dependencies)]
pub struct NewDependency {
    pub filename: String,
    pub tool: String,
    pub dependency: String,
}

impl NewDependency {
    pub fn from_wheel(my_filename: &str, dependency: &Dependency) -> NewDependency {
        NewDependency {
            filename: my_filename.to_string(),
            tool: dependency.tool.as_str().to_string(),
            dependency: dependency.dependency.clone(),
        }
    }

    pub fn insert_batch(
        deps: &[NewDependency],
        connection: &mut SqliteConnection,
    ) -> Result<()> {
        diesel::insert_into(dependencies::table)
            .values(deps)
            .execute(connection)?;
        Ok(())
    }
}
