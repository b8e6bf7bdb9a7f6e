//! Built-in sample project used when `runBuild` is called without sources.

use super::mirror::MirrorMap;

const SAMPLE_FILES: &[(&str, &str)] = &[
    ("index.js", include_str!("../../assets/sample-app/index.js")),
    (
        "package.json",
        include_str!("../../assets/sample-app/package.json"),
    ),
    ("build.js", include_str!("../../assets/sample-app/build.js")),
];

/// Express app listening on port 3111, keyed by store-relative path.
pub fn sample_project() -> MirrorMap {
    SAMPLE_FILES
        .iter()
        .map(|(path, contents)| (path.to_string(), contents.to_string()))
        .collect()
}
