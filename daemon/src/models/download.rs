use crate::schema::*;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use wheelhouse_common::api::DownloadRecord;
use wheelhouse_common::errors::*;

#[derive(Insertable, PartialEq, Debug, Clone)]
#[diesel(table_name = downloads)]
pub struct NewDownload {
    pub filename: String,
    pub accessed_by: String,
    pub accessed_at: NaiveDateTime,
    pub arch: Option<String>,
    pub distro_name: Option<String>,
    pub distro_version: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub py_name: Option<String>,
    pub py_version: Option<String>,
}

impl NewDownload {
    pub fn from_record(record: DownloadRecord) -> NewDownload {
        NewDownload {
            filename: record.filename,
            accessed_by: record.accessed_by,
            accessed_at: record.accessed_at,
            arch: record.arch,
            distro_name: record.distro_name,
            distro_version: record.distro_version,
            os_name: record.os_name,
            os_version: record.os_version,
            py_name: record.py_name,
            py_version: record.py_version,
        }
    }

    pub fn insert_batch(
        records: &[NewDownload],
        connection: &mut SqliteConnection,
    ) -> Result<()> {
        diesel::insert_into(downloads::table)
            .values(records)
            .execute(connection)?;
        Ok(())
    }
}
