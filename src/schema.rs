//! Schema DDL and the one-time database initialization sequence.
//!
//! Layout-affecting pragmas (page size, auto-vacuum) must land before the
//! first table exists; the DDL itself runs inside an immediate transaction
//! so concurrent openers serialize cleanly. Runtime pragmas are applied
//! per-connection afterwards by [`crate::conn::init_conn`].

use crate::config::CacheConfig;
use crate::conn::{read_pragma_i64, set_and_verify_pragma};
use crate::error::CacheError;
use rusqlite::Connection;
use tracing::warn;

// `values` is a keyword, hence the quoting.
const SCHEMA_DDL: &str = r#"
create table if not exists keys (
    key_id integer primary key,
    key text unique not null,
    length integer not null,
    create_time integer not null,
    last_used integer not null,
    access_count integer not null default 0
);

create table if not exists blobs (
    blob_id integer primary key,
    blob blob not null
);

create table if not exists "values" (
    value_id integer not null references keys(key_id) on delete cascade,
    offset integer not null,
    blob_id integer not null references blobs(blob_id) on delete restrict,
    primary key (value_id, offset)
);

create table if not exists tags (
    key_id integer not null references keys(key_id) on delete cascade,
    tag_name text not null,
    value,
    primary key (key_id, tag_name)
);

create table if not exists settings (
    name text primary key,
    value
);
"#;

// Drops a blob row once the last segment referencing it is gone. Fires for
// cascaded deletes too because connections run with recursive_triggers on.
const TRIGGER_DDL: &str = r#"
create trigger if not exists values_gc_blobs after delete on "values"
when not exists (select 1 from "values" where blob_id = old.blob_id)
begin
    delete from blobs where blob_id = old.blob_id;
end;
"#;

/// Creates the cache schema on `conn`. Page size only takes effect on an
/// empty database and is verified against what the engine applied.
pub fn init_schema(conn: &Connection, page_size: u32, triggers: bool) -> Result<(), CacheError> {
    set_and_verify_pragma(conn, "page_size", &page_size.to_string())?;
    create_tables(conn, triggers)
}

fn create_tables(conn: &Connection, triggers: bool) -> Result<(), CacheError> {
    conn.execute_batch(SCHEMA_DDL)?;
    if triggers {
        conn.execute_batch(TRIGGER_DDL)?;
    }
    Ok(())
}

/// One-time initialization for a newly opened cache: layout pragmas, DDL,
/// and the persisted capacity setting. The layout pragmas cannot run inside
/// an explicit transaction, so they precede the DDL transaction.
pub(crate) fn init_db(conn: &Connection, cfg: &CacheConfig) -> Result<(), CacheError> {
    if !cfg.dont_init_schema {
        set_and_verify_pragma(conn, "page_size", &cfg.effective_page_size().to_string())?;
    }
    if let Some(mode) = cfg.set_auto_vacuum {
        // Only effective before the first table is created.
        set_and_verify_pragma(conn, "auto_vacuum", &mode.as_pragma_int().to_string())?;
    }
    if let Some(required) = cfg.require_auto_vacuum {
        let actual = read_pragma_i64(conn, "auto_vacuum")?;
        if actual != required.as_pragma_int() {
            return Err(CacheError::PragmaMismatch {
                name: "auto_vacuum".to_owned(),
                requested: required.as_pragma_int().to_string(),
                actual: actual.to_string(),
            });
        }
    }

    conn.execute_batch("begin immediate")?;
    let body = init_db_body(conn, cfg);
    match body {
        Ok(()) => {
            conn.execute_batch("commit")?;
            Ok(())
        }
        Err(err) => {
            if let Err(rollback_err) = conn.execute_batch("rollback") {
                warn!(error = %rollback_err, "rollback after failed schema init");
                return Err(err.join(rollback_err.into()));
            }
            Err(err)
        }
    }
}

fn init_db_body(conn: &Connection, cfg: &CacheConfig) -> Result<(), CacheError> {
    if !cfg.dont_init_schema {
        create_tables(conn, !cfg.no_triggers)?;
    }
    apply_capacity(conn, cfg.capacity)?;
    Ok(())
}

/// Positive capacity is persisted, negative removes the limit, zero leaves
/// whatever is already stored.
fn apply_capacity(conn: &Connection, capacity: i64) -> Result<(), CacheError> {
    if capacity > 0 {
        conn.execute(
            "insert or replace into settings (name, value) values ('capacity', ?1)",
            [capacity],
        )?;
    } else if capacity < 0 {
        conn.execute("delete from settings where name = 'capacity'", [])?;
    }
    Ok(())
}

pub(crate) fn read_capacity(conn: &Connection) -> Result<Option<i64>, CacheError> {
    crate::conn::query_single_row(
        conn,
        "select value from settings where name = 'capacity'",
        [],
        |row| row.get::<_, i64>(0),
    )
}

#[cfg(test)]
mod tests {
    use super::{init_db, read_capacity};
    use crate::config::CacheConfig;
    use rusqlite::Connection;

    fn fresh_conn() -> Connection {
        Connection::open_in_memory().expect("open")
    }

    #[test]
    fn init_creates_all_tables_and_trigger() {
        let conn = fresh_conn();
        init_db(&conn, &CacheConfig::default()).expect("init");
        let tables: Vec<String> = conn
            .prepare("select name from sqlite_master where type='table' order by name")
            .expect("prepare")
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows");
        assert_eq!(tables, ["blobs", "keys", "settings", "tags", "values"]);
        let triggers: i64 = conn
            .query_row(
                "select count(*) from sqlite_master where type='trigger'",
                [],
                |row| row.get(0),
            )
            .expect("trigger count");
        assert_eq!(triggers, 1);
    }

    #[test]
    fn no_triggers_option_skips_trigger_ddl() {
        let conn = fresh_conn();
        let cfg = CacheConfig {
            no_triggers: true,
            ..CacheConfig::default()
        };
        init_db(&conn, &cfg).expect("init");
        let triggers: i64 = conn
            .query_row(
                "select count(*) from sqlite_master where type='trigger'",
                [],
                |row| row.get(0),
            )
            .expect("trigger count");
        assert_eq!(triggers, 0);
    }

    #[test]
    fn capacity_is_persisted_removed_and_left_alone() {
        let conn = fresh_conn();
        init_db(&conn, &CacheConfig::default().with_capacity(1 << 20)).expect("init");
        assert_eq!(read_capacity(&conn).expect("read"), Some(1 << 20));

        // Zero leaves the stored value untouched.
        init_db(&conn, &CacheConfig::default()).expect("reinit");
        assert_eq!(read_capacity(&conn).expect("read"), Some(1 << 20));

        init_db(&conn, &CacheConfig::default().with_capacity(-1)).expect("unlimit");
        assert_eq!(read_capacity(&conn).expect("read"), None);
    }

    #[test]
    fn reinit_is_idempotent() {
        let conn = fresh_conn();
        init_db(&conn, &CacheConfig::default()).expect("first");
        init_db(&conn, &CacheConfig::default()).expect("second");
    }
}
