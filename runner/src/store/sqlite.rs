use super::{ArrayKind, StoreError, StoredArray};
use rusqlite::{params, Connection, OptionalExtension};
use std::{fmt::Debug, path::Path};
use tracing::{debug, error, info};

#[derive(Debug)]
/// A store file: named arrays grouped by the struct (`owner`) they belong to
pub struct Store {
    connection: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let store = Self {
            connection: Connection::open(path)?,
        };
        store.init()?;

        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        for (counter, table) in SQL_SCHEMA.iter().enumerate() {
            match self.connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({}/{SQL_SCHEMA_NUMBER})", counter + 1),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({}/{SQL_SCHEMA_NUMBER}): {error}", counter + 1);

                    return Err(StoreError::SQLite(error));
                }
            };
        }

        Ok(())
    }

    pub fn write(&self, owner: &str, name: &str, array: &StoredArray) -> Result<(), StoreError> {
        let (rows, cols) = array.shape();

        self.connection
            .prepare_cached(
                "insert or replace into arrays
                 (owner, name, kind, rows, cols, data)
                 values (?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                owner,
                name,
                array.kind() as u8,
                rows as i64,
                cols as i64,
                array.encode()
            ])?;

        debug!(owner = owner, name = name, "Stored array");

        Ok(())
    }

    /// store all arrays at once, nothing is written if one of them fails
    pub fn write_all<I: Iterator<Item = (String, StoredArray)>>(
        &self,
        owner: &str,
        arrays: I,
    ) -> Result<(), StoreError> {
        self.transaction(owner, arrays, false)
    }

    /// like [`Store::write_all`], but every array `owner` had before is dropped
    pub fn replace_all<I: Iterator<Item = (String, StoredArray)>>(
        &self,
        owner: &str,
        arrays: I,
    ) -> Result<(), StoreError> {
        self.transaction(owner, arrays, true)
    }

    fn transaction<I: Iterator<Item = (String, StoredArray)>>(
        &self,
        owner: &str,
        mut arrays: I,
        replace: bool,
    ) -> Result<(), StoreError> {
        let mut counter = 0;

        // NOTE: there are no nested transactions since a store never shares its connection
        let mut tx = self.connection.unchecked_transaction()?;
        tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);
        if replace {
            let dropped = self
                .connection
                .prepare_cached("delete from arrays where owner = ?")?
                .execute(params![owner])?;
            debug!(owner = owner, "Dropped {dropped} old arrays");
        }
        arrays.try_for_each(|(name, array)| -> Result<(), StoreError> {
            counter += 1;
            self.write(owner, &name, &array)
        })?;
        tx.commit()?;

        info!(owner = owner, "Stored {counter} arrays");

        Ok(())
    }

    pub fn read(&self, owner: &str, name: &str) -> Result<Option<StoredArray>, StoreError> {
        let row = self
            .connection
            .prepare_cached("select kind, rows, cols, data from arrays where owner = ? and name = ?")?
            .query_row(params![owner, name], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })
            .optional()?;

        match row {
            Some((kind, rows, cols, data)) => {
                let kind = ArrayKind::try_from(kind).map_err(|kind| StoreError::Corrupt {
                    field: name.to_owned(),
                    reason: format!("unknown array kind {kind}"),
                })?;

                StoredArray::decode(name, kind, rows as usize, cols as usize, &data).map(Some)
            }
            None => Ok(None),
        }
    }

    /// names of all arrays stored for `owner`
    pub fn names(&self, owner: &str) -> Result<Vec<String>, StoreError> {
        self.connection
            .prepare_cached("select name from arrays where owner = ? order by name")?
            .query_map(params![owner], |row| row.get(0))?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<String>, StoreError>(init)
            })
    }

    pub fn close(mut self) -> Result<(), StoreError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Failed to close connection");

                return Err(StoreError::SQLite(error));
            }
        }

        debug!("Closed SQLite connection");

        Ok(())
    }
}

pub const SQL_SCHEMA: [&str; 1] = ["create table if not exists arrays (
    owner text not null,
    name text not null,
    kind integer not null,
    rows integer not null,
    cols integer not null,
    data blob not null,
    primary key (owner, name)
);"];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_keep_their_bits() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("arrays.db")).unwrap();
        let values = vec![f64::NAN, -0.0, 1.0 / 3.0, f64::INFINITY, 1e-300];

        store
            .write("results", "minFlux", &StoredArray::column(values.clone()))
            .unwrap();
        let read = store
            .read("results", "minFlux")
            .unwrap()
            .unwrap()
            .into_floats("minFlux")
            .unwrap();

        assert_eq!(
            read.iter().map(|value| value.to_bits()).collect::<Vec<_>>(),
            values.iter().map(|value| value.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn overwrites_and_lists_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("arrays.db")).unwrap();

        store
            .write_all(
                "model",
                vec![
                    ("b".to_owned(), StoredArray::scalar(1.0)),
                    ("a".to_owned(), StoredArray::scalar(2.0)),
                ]
                .into_iter(),
            )
            .unwrap();
        store.write("model", "a", &StoredArray::scalar(3.0)).unwrap();

        assert_eq!(store.names("model").unwrap(), vec!["a", "b"]);
        assert_eq!(
            store.read("model", "a").unwrap(),
            Some(StoredArray::scalar(3.0))
        );
        assert_eq!(store.read("other", "a").unwrap(), None);
        store.close().unwrap();
    }

    #[test]
    fn replace_drops_arrays_of_the_same_owner() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("arrays.db")).unwrap();
        store.write("results", "fvamin", &StoredArray::scalar(1.0)).unwrap();
        store.write("model", "b", &StoredArray::scalar(2.0)).unwrap();

        store
            .replace_all(
                "results",
                vec![("minFlux".to_owned(), StoredArray::scalar(3.0))].into_iter(),
            )
            .unwrap();

        assert_eq!(store.names("results").unwrap(), vec!["minFlux"]);
        assert_eq!(store.names("model").unwrap(), vec!["b"]);
    }
}
