use std::{env, path::PathBuf};

/// Locates an installed native package for a `-sys` build script.
///
/// Candidates are the directory named by `env_var`, if set, followed by
/// `default_paths`. The first candidate containing every file in
/// `check_files` wins. Emits `cargo:rerun-if-env-changed` for `env_var`.
///
/// # Panics
///
/// Panics if no candidate contains all of `check_files`.
pub fn find_package(env_var: &str, default_paths: &[&str], check_files: &[&str]) -> PathBuf {
    println!("cargo:rerun-if-env-changed={env_var}");
    env::var_os(env_var)
        .map(PathBuf::from)
        .into_iter()
        .chain(default_paths.iter().map(PathBuf::from))
        .find(|dir| check_files.iter().all(|file| dir.join(file).is_file()))
        .unwrap_or_else(|| {
            panic!(
                "find_package: {env_var} is not set and none of {default_paths:?} contains {check_files:?}"
            )
        })
}
