//! Per-user, per-domain rights such as `logs` -> `"3,7"` (or `"3;7"`) or
//! `all` -> `"all"`.

use rusqlite::Connection;

use crate::models::user;

pub const ALL: &str = "all";

/// Source of stored right strings.
pub trait RightsLookup {
    fn right(&self, user_id: i64, domain: &str) -> anyhow::Result<Option<String>>;
}

impl RightsLookup for Connection {
    fn right(&self, user_id: i64, domain: &str) -> anyhow::Result<Option<String>> {
        user::find_right(self, user_id, domain)
    }
}

/// Effective right string for `domain`; a granted `all` domain wins over
/// anything stored for the specific domain.
pub fn effective_right<L>(lookup: &L, user_id: i64, domain: &str) -> anyhow::Result<Option<String>>
where
    L: RightsLookup + ?Sized,
{
    if domain != ALL {
        if let Some(global) = lookup.right(user_id, ALL)? {
            if global == ALL {
                return Ok(Some(ALL.to_string()));
            }
        }
    }
    lookup.right(user_id, domain)
}

pub fn is_authorized<L>(lookup: &L, user_id: i64, domain: &str, client_id: i64) -> anyhow::Result<bool>
where
    L: RightsLookup + ?Sized,
{
    let Some(right) = effective_right(lookup, user_id, domain)? else {
        return Ok(false);
    };
    if right == ALL {
        return Ok(true);
    }
    Ok(right
        .split([',', ';'])
        .filter_map(|tok| tok.trim().parse::<i64>().ok())
        .any(|id| id == client_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeRights(HashMap<(i64, String), String>);

    impl FakeRights {
        fn new(entries: &[(i64, &str, &str)]) -> Self {
            Self(
                entries
                    .iter()
                    .map(|(u, d, r)| ((*u, d.to_string()), r.to_string()))
                    .collect(),
            )
        }
    }

    impl RightsLookup for FakeRights {
        fn right(&self, user_id: i64, domain: &str) -> anyhow::Result<Option<String>> {
            Ok(self.0.get(&(user_id, domain.to_string())).cloned())
        }
    }

    #[test]
    fn test_global_all_grants_everything() {
        let rights = FakeRights::new(&[(1, "all", "all"), (1, "logs", "99")]);
        for domain in ["logs", "status", "browse_backups", "all"] {
            for client in [1, 3, 5, 1000] {
                assert!(is_authorized(&rights, 1, domain, client).unwrap());
            }
        }
    }

    #[test]
    fn test_client_list() {
        let rights = FakeRights::new(&[(2, "logs", "3,7")]);
        assert!(is_authorized(&rights, 2, "logs", 3).unwrap());
        assert!(is_authorized(&rights, 2, "logs", 7).unwrap());
        assert!(!is_authorized(&rights, 2, "logs", 5).unwrap());
        assert!(!is_authorized(&rights, 2, "status", 3).unwrap());

        let rights = FakeRights::new(&[(4, "logs", "3;7"), (5, "logs", " 9 ; 11,12 ")]);
        assert!(is_authorized(&rights, 4, "logs", 3).unwrap());
        assert!(is_authorized(&rights, 4, "logs", 7).unwrap());
        assert!(!is_authorized(&rights, 4, "logs", 37).unwrap());
        for client in [9, 11, 12] {
            assert!(is_authorized(&rights, 5, "logs", client).unwrap());
        }
    }

    #[test]
    fn test_domain_all_value() {
        let rights = FakeRights::new(&[(3, "logs", "all")]);
        assert!(is_authorized(&rights, 3, "logs", 12).unwrap());
        assert!(!is_authorized(&rights, 3, "status", 12).unwrap());
    }

    #[test]
    fn test_non_all_global_does_not_override() {
        let rights = FakeRights::new(&[(4, "all", "none"), (4, "logs", "8")]);
        assert!(is_authorized(&rights, 4, "logs", 8).unwrap());
        assert!(!is_authorized(&rights, 4, "logs", 9).unwrap());
    }

    #[test]
    fn test_missing_records_deny() {
        let rights = FakeRights::new(&[]);
        assert!(!is_authorized(&rights, 5, "logs", 1).unwrap());
        assert_eq!(effective_right(&rights, 5, "logs").unwrap(), None);
    }

    #[test]
    fn test_sqlite_lookup() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connection::test_pool(dir.path());
        let conn = pool.get().unwrap();
        let user_id = user::create(&conn, "viewer").unwrap();
        user::set_right(&conn, user_id, "logs", "3, 7").unwrap();

        assert!(is_authorized(&*conn, user_id, "logs", 7).unwrap());
        assert!(!is_authorized(&*conn, user_id, "logs", 4).unwrap());
    }
}
