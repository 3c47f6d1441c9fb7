use rusqlite::Connection;
use tracing::debug;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS rooms (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            expires_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_rooms_expiry
            ON rooms(expires_at);

        CREATE TABLE IF NOT EXISTS sessions (
            id          TEXT NOT NULL,
            room_id     TEXT NOT NULL,
            handle      TEXT NOT NULL,
            expires_at  INTEGER NOT NULL,
            PRIMARY KEY (room_id, id)
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_expiry
            ON sessions(expires_at);

        -- ts is unix nanoseconds (UTC) and doubles as the record id
        CREATE TABLE IF NOT EXISTS messages (
            room_id     TEXT NOT NULL,
            ts          INTEGER NOT NULL,
            payload     BLOB NOT NULL,
            PRIMARY KEY (room_id, ts)
        ) WITHOUT ROWID;
        ",
    )?;

    debug!("Store migrations complete");
    Ok(())
}
