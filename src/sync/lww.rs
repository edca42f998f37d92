// sync/lww.rs - deterministic three-key Last-Write-Wins comparison

/// One side of a Last-Write-Wins comparison: the fields consulted, in order,
/// to decide whether a remote record should overwrite a local one.
pub struct LwwKey<'a> {
    pub updated_at: &'a str,
    pub server_timestamp: Option<&'a str>,
    /// Entity id (notes/relations) or date (reflections) — the final,
    /// always-decisive tiebreaker.
    pub id: &'a str,
}

/// Returns true iff `remote` should overwrite `local`. Three keys are
/// consulted in order, each a plain string comparison: `updated_at`, then
/// `server_timestamp` (falling back to `updated_at` when missing on either
/// side), then the id. The comparison is total: given identical keys on both
/// sides it returns false, and `should_update(a, b)` and `should_update(b,
/// a)` never both say true.
pub fn should_update(local: &LwwKey<'_>, remote: &LwwKey<'_>) -> bool {
    if local.updated_at != remote.updated_at {
        return remote.updated_at > local.updated_at;
    }

    let local_server_ts = local.server_timestamp.unwrap_or(local.updated_at);
    let remote_server_ts = remote.server_timestamp.unwrap_or(remote.updated_at);
    if local_server_ts != remote_server_ts {
        return remote_server_ts > local_server_ts;
    }

    remote.id > local.id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key<'a>(updated_at: &'a str, server_timestamp: Option<&'a str>, id: &'a str) -> LwwKey<'a> {
        LwwKey { updated_at, server_timestamp, id }
    }

    #[test]
    fn remote_newer_updated_at_wins() {
        let local = key("2025-01-10T10:00:00.000Z", None, "A");
        let remote = key("2025-01-10T11:00:00.000Z", None, "A");
        assert!(should_update(&local, &remote));
        assert!(!should_update(&remote, &local));
    }

    #[test]
    fn tie_breaks_on_id_lexicographically() {
        let local = key("2025-01-10T10:00:00.000Z", None, "A");
        let remote = key("2025-01-10T10:00:00.000Z", None, "B");
        assert!(should_update(&local, &remote));

        let local2 = key("2025-01-10T10:00:00.000Z", None, "B");
        let remote2 = key("2025-01-10T10:00:00.000Z", None, "A");
        assert!(!should_update(&local2, &remote2));
    }

    #[test]
    fn identical_records_never_update() {
        let a = key("2025-01-10T10:00:00.000Z", Some("ts-1"), "A");
        let b = key("2025-01-10T10:00:00.000Z", Some("ts-1"), "A");
        assert!(!should_update(&a, &b));
        assert!(!should_update(&b, &a));
    }

    #[test]
    fn server_timestamp_breaks_updated_at_ties() {
        let local = key("2025-01-10T10:00:00.000Z", Some("ts-1"), "A");
        let remote = key("2025-01-10T10:00:00.000Z", Some("ts-2"), "A");
        assert!(should_update(&local, &remote));
    }
}
