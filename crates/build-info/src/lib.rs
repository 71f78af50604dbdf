use once_cell::sync::Lazy;

static BUILD_ID: Lazy<String> = Lazy::new(|| {
    option_env!("COURIER_BUILD_ID")
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .unwrap_or("unknown build")
        .to_string()
});

/// Build identifier, e.g. "2026-10-05 15:47:12 UTC | v0.1.0-8a4f1d2-dirty".
pub fn build_id() -> &'static str {
    BUILD_ID.as_str()
}

/// One-line startup banner for a binary.
pub fn formatted_banner(package: &str, version: &str) -> String {
    format!("{} {} | {}", package, version, build_id())
}
