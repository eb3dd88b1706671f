use crate::config::VERSION;

/// Returns the build version.
pub async fn version() -> &'static str {
    VERSION
}
