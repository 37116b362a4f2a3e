const DEFAULT_DEVICE_TYPE: &str = "desktop";

/// Map a `User-Agent` string to `desktop`, `mobile` or `tablet` via `woothee`.
///
/// Returns `None` if the UA is empty or cannot be parsed.
fn device_from_user_agent(user_agent: &str) -> Option<&'static str> {
    if user_agent.trim().is_empty() {
        return None;
    }
    let result = woothee::parser::Parser::new().parse(user_agent)?;
    // woothee `category`: "smartphone" / "mobilephone" are handsets; anything
    // it does not recognise is counted as desktop.
    let device_type = match result.category {
        "smartphone" | "mobilephone" => "mobile",
        "tablet" => "tablet",
        _ => DEFAULT_DEVICE_TYPE,
    };
    Some(device_type)
}

/// Device type for a new session: the client's explicit value, else the
/// user agent's classification, else `desktop`.
pub fn resolve_device_type(explicit: Option<&str>, user_agent: Option<&str>) -> String {
    if let Some(device_type) = explicit.map(str::trim).filter(|d| !d.is_empty()) {
        return device_type.to_ascii_lowercase();
    }
    user_agent
        .and_then(device_from_user_agent)
        .unwrap_or(DEFAULT_DEVICE_TYPE)
        .to_string()
}
