// LN Channel Core Library implementing Lightning-style payment channels
// Written in 2022-2024 by
//     LN Channel Core contributors
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Schema migrations.
//!
//! A monotone version number in the `meta` bucket is compared at open time
//! with the built-in migration list; outstanding migrators run in order,
//! each inside its own transaction together with the version bump, so a
//! failing migration leaves the database at its previous version.

use super::{Error, TREE_META};

/// Schema version written by the current build.
pub const DB_VERSION: u16 = 1;

/// Key of the version value inside the `meta` tree.
pub const META_VERSION_KEY: &[u8] = b"version";

struct Migration {
    version: u16,
    name: &'static str,
    apply: fn(&sled::Db) -> Result<(), Error>,
}

/// Ordered list of all known migrations; `MIGRATIONS[i]` migrates a
/// version-`i` database to version `i + 1`.
const MIGRATIONS: [Migration; 1] = [Migration {
    version: 1,
    name: "establish-top-level-buckets",
    apply: establish_buckets,
}];

/// Brings the database up to [`DB_VERSION`].
pub(super) fn run_migrations(db: &sled::Db) -> Result<(), Error> {
    let meta = db.open_tree(TREE_META)?;
    let current = match meta.get(META_VERSION_KEY)? {
        None => 0,
        Some(raw) => {
            let mut buf = [0u8; 2];
            buf.copy_from_slice(&raw);
            u16::from_be_bytes(buf)
        }
    };
    if current > DB_VERSION {
        return Err(Error::VersionTooNew {
            found: current,
            supported: DB_VERSION,
        });
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        debug!(
            "applying channel store migration #{}: {}",
            migration.version, migration.name
        );
        (migration.apply)(db)?;
        meta.insert(
            META_VERSION_KEY,
            &migration.version.to_be_bytes()[..],
        )?;
        meta.flush()?;
    }
    Ok(())
}

fn establish_buckets(db: &sled::Db) -> Result<(), Error> {
    for name in [
        super::TREE_OPEN_CHANNELS,
        super::TREE_CLOSED_CHANNELS,
        super::TREE_INVOICES,
        super::TREE_NODE_INFO,
        super::TREE_GRAPH_NODE,
        super::TREE_GRAPH_EDGE,
        super::TREE_GRAPH_META,
    ] {
        db.open_tree(name)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_database_reaches_latest_version() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        run_migrations(&db).unwrap();
        let meta = db.open_tree(TREE_META).unwrap();
        let raw = meta.get(META_VERSION_KEY).unwrap().unwrap();
        assert_eq!(&raw[..], &DB_VERSION.to_be_bytes());
        // Running again is a no-op
        run_migrations(&db).unwrap();
    }

    #[test]
    fn newer_database_is_rejected()  {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let meta = db.open_tree(TREE_META).unwrap();
        meta.insert(META_VERSION_KEY, &99u16.to_be_bytes()[..]).unwrap();
        assert_eq!(
            run_migrations(&db),
            Err(Error::VersionTooNew {
                found: 99,
                supported: DB_VERSION,
            })
        );
    }
}
