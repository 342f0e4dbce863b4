diesel::table! {
    packages (id) {
        id -> Integer,
        name -> Text,
        skip -> Text,
        added_at -> Timestamp,
    }
}

diesel::table! {
    versions (id) {
        id -> Integer,
        package_id -> Integer,
        version -> Text,
        released_at -> Timestamp,
        skip -> Text,
    }
}

diesel::table! {
    builds (id) {
        id -> Integer,
        version_id -> Integer,
        abi_tag -> Text,
        built_by -> Nullable<Text>,
        duration_ms -> BigInt,
        status -> Bool,
        started_at -> Timestamp,
        build_log -> Text,
    }
}

diesel::table! {
    files (filename) {
        filename -> Text,
        build_id -> Integer,
        filesize -> BigInt,
        filehash -> Text,
        package_tag -> Text,
        package_version_tag -> Text,
        py_version_tag -> Text,
        abi_tag -> Text,
        platform_tag -> Text,
    }
}

diesel::table! {
    dependencies (id) {
        id -> Integer,
        filename -> Text,
        tool -> Text,
        dependency -> Text,
    }
}

diesel::table! {
    downloads (id) {
        id -> Integer,
        filename -> Text,
        accessed_by -> Text,
        accessed_at -> Timestamp,
        arch -> Nullable<Text>,
        distro_name -> Nullable<Text>,
        distro_version -> Nullable<Text>,
        os_name -> Nullable<Text>,
        os_version -> Nullable<Text>,
        py_name -> Nullable<Text>,
        py_version -> Nullable<Text>,
    }
}

diesel::joinable!(versions -> packages (package_id));
diesel::joinable!(builds -> versions (version_id));
diesel::joinable!(files -> builds (build_id));
diesel::joinable!(dependencies -> files (filename));

diesel::allow_tables_to_appear_in_same_query!(
    packages,
    versions,
    builds,
    files,
    dependencies,
    downloads,
);
