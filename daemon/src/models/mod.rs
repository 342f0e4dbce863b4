mod build;
mod download;
mod file;
mod package;
mod stats;
mod version;

pub use self::build::{Build, BuildDetail, DeletedBuild, NewBuild};
pub use self::download::NewDownload;
pub use self::file::{File, NewDependency};
pub use self::package::{NewPackage, Package};
pub use self::stats::collect_statistics;
pub use self::version::{NewVersion, Version};

diesel::define_sql_function! {
    fn last_insert_rowid() -> diesel::sql_types::Integer;
}
