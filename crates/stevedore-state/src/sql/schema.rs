//! SQLite schema for the relational backend.
//!
//! The `IDNamespace` table is the combined container+pod ID namespace: both
//! config tables carry a deferred foreign key into it, so an ID can never be
//! claimed by both kinds. Name uniqueness across the two kinds is enforced
//! at insert time since `UNIQUE` cannot span tables.

use rusqlite::Connection;
use stevedore_common::constants::SCHEMA_VERSION;

use crate::error::{Result, StateError};

/// Creates every table if missing. Runs inside the caller's transaction.
pub(super) fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS DBConfig (
             ID            INTEGER PRIMARY KEY NOT NULL CHECK (ID IN (1)),
             SchemaVersion INTEGER NOT NULL,
             Os            TEXT    NOT NULL,
             StaticDir     TEXT    NOT NULL,
             TmpDir        TEXT    NOT NULL,
             GraphRoot     TEXT    NOT NULL,
             RunRoot       TEXT    NOT NULL,
             GraphDriver   TEXT    NOT NULL,
             VolumeDir     TEXT    NOT NULL
         );

         CREATE TABLE IF NOT EXISTS IDNamespace (
             ID TEXT PRIMARY KEY NOT NULL
         );

         CREATE TABLE IF NOT EXISTS ContainerConfig (
             ID    TEXT PRIMARY KEY NOT NULL,
             Name  TEXT UNIQUE NOT NULL,
             PodID TEXT,
             Json  TEXT NOT NULL,
             FOREIGN KEY (ID)    REFERENCES IDNamespace (ID) DEFERRABLE INITIALLY DEFERRED,
             FOREIGN KEY (PodID) REFERENCES PodConfig   (ID) DEFERRABLE INITIALLY DEFERRED
         );

         CREATE TABLE IF NOT EXISTS ContainerState (
             ID   TEXT PRIMARY KEY NOT NULL,
             Json TEXT NOT NULL,
             FOREIGN KEY (ID) REFERENCES ContainerConfig (ID) DEFERRABLE INITIALLY DEFERRED
         );

         CREATE TABLE IF NOT EXISTS ContainerDependency (
             ID           TEXT NOT NULL,
             DependencyID TEXT NOT NULL,
             PRIMARY KEY (ID, DependencyID),
             CHECK (ID <> DependencyID),
             FOREIGN KEY (ID)           REFERENCES ContainerConfig (ID) DEFERRABLE INITIALLY DEFERRED,
             FOREIGN KEY (DependencyID) REFERENCES ContainerConfig (ID) DEFERRABLE INITIALLY DEFERRED
         );

         CREATE TABLE IF NOT EXISTS ContainerVolume (
             ContainerID TEXT NOT NULL,
             VolumeName  TEXT NOT NULL,
             PRIMARY KEY (ContainerID, VolumeName),
             FOREIGN KEY (ContainerID) REFERENCES ContainerConfig (ID) DEFERRABLE INITIALLY DEFERRED
         );

         CREATE TABLE IF NOT EXISTS ContainerNetwork (
             ContainerID TEXT NOT NULL,
             NetworkName TEXT NOT NULL,
             Json        TEXT NOT NULL,
             PRIMARY KEY (ContainerID, NetworkName),
             FOREIGN KEY (ContainerID) REFERENCES ContainerConfig (ID) DEFERRABLE INITIALLY DEFERRED
         );

         CREATE TABLE IF NOT EXISTS ContainerExecSession (
             ID          TEXT PRIMARY KEY NOT NULL,
             ContainerID TEXT NOT NULL,
             FOREIGN KEY (ContainerID) REFERENCES ContainerConfig (ID)
         );

         CREATE TABLE IF NOT EXISTS ContainerExitCode (
             ID        TEXT    PRIMARY KEY NOT NULL,
             Timestamp INTEGER NOT NULL,
             ExitCode  INTEGER NOT NULL CHECK (ExitCode BETWEEN -1 AND 255)
         );

         CREATE TABLE IF NOT EXISTS PodConfig (
             ID   TEXT PRIMARY KEY NOT NULL,
             Name TEXT UNIQUE NOT NULL,
             Json TEXT NOT NULL,
             FOREIGN KEY (ID) REFERENCES IDNamespace (ID) DEFERRABLE INITIALLY DEFERRED
         );

         CREATE TABLE IF NOT EXISTS PodState (
             ID   TEXT PRIMARY KEY NOT NULL,
             Json TEXT NOT NULL,
             FOREIGN KEY (ID) REFERENCES PodConfig (ID) DEFERRABLE INITIALLY DEFERRED
         );

         CREATE TABLE IF NOT EXISTS VolumeConfig (
             Name      TEXT PRIMARY KEY NOT NULL,
             StorageID TEXT,
             Json      TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS VolumeState (
             Name TEXT PRIMARY KEY NOT NULL,
             Json TEXT NOT NULL,
             FOREIGN KEY (Name) REFERENCES VolumeConfig (Name) DEFERRABLE INITIALLY DEFERRED
         );",
    )?;
    Ok(())
}

/// Checks the recorded schema version against the version this build
/// supports.
///
/// A store written by a newer build is a hard error; an older version would
/// be migrated here step by step, but version 1 is the first.
pub(super) fn check_schema_version(recorded: i64) -> Result<()> {
    if recorded > SCHEMA_VERSION {
        return Err(StateError::BadConfig {
            message: format!(
                "store schema version {recorded} is newer than the supported \
                 version {SCHEMA_VERSION}; refusing to open"
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_create_idempotently() {
        let conn = Connection::open_in_memory().expect("open");
        create_tables(&conn).expect("first create");
        create_tables(&conn).expect("second create");
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        check_schema_version(SCHEMA_VERSION).expect("current version must pass");
        let err = check_schema_version(SCHEMA_VERSION + 1).expect_err("newer must fail");
        assert!(matches!(err, StateError::BadConfig { .. }));
    }
}
