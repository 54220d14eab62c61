pub fn now_seconds() -> crate::Result<i64> {
    Ok(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| format!("invalid duration {:?}", e))?
        .as_secs() as i64)
}

/// Convert a provider `expires_in` (seconds from now) into an
/// epoch-seconds expiration timestamp
pub fn epoch_expiration(expires_in: u64) -> crate::Result<i64> {
    let now = std::time::SystemTime::now();
    Ok(now
        .checked_add(std::time::Duration::from_secs(expires_in))
        .ok_or_else(|| format!("can't add {:?} to time {:?}", expires_in, now))?
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| format!("invalid duration {:?}", e))?
        .as_secs() as i64)
}
