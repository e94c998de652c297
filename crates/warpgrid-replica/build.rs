fn main() {
    // Only link libdqlite when the `libdqlite` feature is enabled. Without
    // it the crate runs against the in-process `LocalEngine`.
    println!("cargo:rerun-if-env-changed=DQLITE_LIB_DIR");
    if std::env::var_os("CARGO_FEATURE_LIBDQLITE").is_none() {
        return;
    }

    if let Ok(dir) = std::env::var("DQLITE_LIB_DIR") {
        println!("cargo:rustc-link-search=native={dir}");
    }
    println!("cargo:rustc-link-lib=dylib=dqlite");
}
