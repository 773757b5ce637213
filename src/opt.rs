use std::collections::HashMap;
use std::env;

use lazy_static::lazy_static;
use tracing::debug;

#[derive(strum_macros::Display, strum_macros::EnumIter, Eq, PartialEq, Debug, Hash, Clone, Copy)]
pub enum DbgFlg {
    #[strum(serialize = "DBG_FLG_DETECT")]
    Detect,
    #[strum(serialize = "DBG_FLG_SCAN")]
    Scan,
    #[strum(serialize = "DBG_FLG_HASH")]
    Hash,
    #[strum(serialize = "DBG_FLG_MATCH")]
    Match,
}

lazy_static! {
    pub static ref DBG_FLG_DEFAULTS: HashMap<DbgFlg, bool> = HashMap::from([
        (DbgFlg::Detect, false),
        (DbgFlg::Scan, true),
        (DbgFlg::Hash, false),
        (DbgFlg::Match, true),
    ]);
}

/// Emits a debug event when the subsystem flag is switched on.
///
/// Flags are read from the environment (`DBG_FLG_SCAN=1`) and fall back to
/// [`DBG_FLG_DEFAULTS`].
pub fn log_if(s: &str, flg: DbgFlg) {
    if checkflag(flg) {
        debug!(flag = %flg, "{}", s);
    }
}

pub fn checkflag(flg: DbgFlg) -> bool {
    env::var(flg.to_string()).ok().map_or_else(
        || DBG_FLG_DEFAULTS.get(&flg).copied().unwrap_or(false),
        |s| s == "1" || s.eq_ignore_ascii_case("true"),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_flag_names() {
        assert_eq!(DbgFlg::Detect.to_string(), "DBG_FLG_DETECT");
        assert_eq!(DbgFlg::Match.to_string(), "DBG_FLG_MATCH");
    }

    #[test]
    fn test_every_flag_has_default() {
        for flg in DbgFlg::iter() {
            assert!(DBG_FLG_DEFAULTS.contains_key(&flg), "{} has no default", flg);
        }
    }

    #[test]
    fn test_env_overrides_default() {
        env::set_var(DbgFlg::Hash.to_string(), "true");
        assert!(checkflag(DbgFlg::Hash));
        env::set_var(DbgFlg::Hash.to_string(), "0");
        assert!(!checkflag(DbgFlg::Hash));
        env::remove_var(DbgFlg::Hash.to_string());
    }
}
