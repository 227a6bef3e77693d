/// Semantic version of the crate, taken from the cargo manifest.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// User-Agent sent with every outbound request, e.g. `Baleen/v0.4.0`.
pub fn user_agent() -> String {
    format!("Baleen/v{}", version())
}
