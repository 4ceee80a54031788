//! `CREATE TABLE` / `DROP TABLE` generation and table reflection.

use tracing::{info, instrument};

use crate::engine::Engine;
use crate::errors::{DbError, Result};
use crate::schema::{Column, ForeignKey, MetaData, SqlType, Table};
use crate::statement::text;

/// Render `CREATE TABLE` for `table`.
pub fn create_table_sql(table: &Table) -> Result<String> {
    let mut lines = Vec::new();
    for col in table.columns() {
        let ty = col.ty.ok_or_else(|| {
            DbError::InvalidOperation(format!(
                "cannot resolve type of {}.{}: foreign key target is not in this metadata",
                table.name(),
                col.name
            ))
        })?;
        let mut line = format!("\t{} {ty}", col.name);
        if col.is_not_null() {
            line.push_str(" NOT NULL");
        }
        lines.push(line);
    }

    let pk: Vec<&str> = table.primary_key().iter().map(|c| c.name.as_str()).collect();
    if !pk.is_empty() {
        lines.push(format!("\tPRIMARY KEY ({})", pk.join(", ")));
    }
    for col in table.columns() {
        if let Some(fk) = &col.foreign_key {
            lines.push(format!(
                "\tFOREIGN KEY({}) REFERENCES {} ({})",
                col.name, fk.table, fk.column
            ));
        }
    }

    Ok(format!("CREATE TABLE {} (\n{}\n)", table.name(), lines.join(",\n")))
}

/// Render `DROP TABLE` for `table`.
pub fn drop_table_sql(table: &Table) -> String {
    format!("DROP TABLE {}", table.name())
}

impl MetaData {
    /// `CREATE TABLE` statements for every table, parents first.
    pub fn create_all_sql(&self) -> Result<Vec<String>> {
        self.sorted_tables().iter().map(|t| create_table_sql(t)).collect()
    }

    /// Create missing tables in dependency order, in one transaction.
    ///
    /// Returns the names of the tables created.
    #[instrument(skip_all, fields(url = %engine.url()))]
    pub fn create_all(&self, engine: &Engine) -> Result<Vec<String>> {
        let sorted = self.sorted_tables();
        let mut pending = Vec::new();
        for table in &sorted {
            if !engine.has_table(table.name())? {
                pending.push((table.name().to_string(), create_table_sql(table)?));
            }
        }

        engine.begin(|conn| {
            for (_, sql) in &pending {
                let _ = conn.execute(&text(sql.as_str()), ())?;
            }
            Ok::<_, DbError>(())
        })?;

        let created: Vec<String> = pending.into_iter().map(|(name, _)| name).collect();
        info!(tables = ?created, "create_all complete");
        Ok(created)
    }

    /// Drop existing tables, dependents first.
    #[instrument(skip_all, fields(url = %engine.url()))]
    pub fn drop_all(&self, engine: &Engine) -> Result<Vec<String>> {
        let mut sorted = self.sorted_tables();
        sorted.reverse();
        let mut existing = Vec::new();
        for table in &sorted {
            if engine.has_table(table.name())? {
                existing.push(table);
            }
        }

        engine.begin(|conn| {
            for table in &existing {
                let _ = conn.execute(&text(drop_table_sql(table)), ())?;
            }
            Ok::<_, DbError>(())
        })?;

        Ok(existing.iter().map(|t| t.name().to_string()).collect())
    }

    /// Load the definition of an existing table and register it.
    #[instrument(skip(self, engine))]
    pub fn reflect_table(&mut self, name: &str, engine: &Engine) -> Result<std::sync::Arc<Table>> {
        let table = reflect(name, engine)?;
        self.add_table(table)
    }
}

fn reflect(name: &str, engine: &Engine) -> Result<Table> {
    if !engine.has_table(name)? {
        return Err(DbError::NoSuchTable(name.to_string()));
    }
    let conn = engine.connect()?;
    let raw = conn.raw();

    let mut fks: Vec<(String, ForeignKey)> = Vec::new();
    {
        let mut stmt = raw.prepare(r#"SELECT "from", "table", "to" FROM pragma_foreign_key_list(?1)"#)?;
        let rows = stmt.query_map([name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?))
        })?;
        for row in rows {
            let (from, table, to) = row?;
            fks.push((
                from,
                ForeignKey {
                    table,
                    column: to.unwrap_or_else(|| "id".to_string()),
                },
            ));
        }
    }

    let mut stmt = raw.prepare(r#"SELECT name, type, "notnull", pk FROM pragma_table_info(?1) ORDER BY cid"#)?;
    let rows = stmt.query_map([name], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, bool>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;

    let mut columns = Vec::new();
    for row in rows {
        let (col_name, declared, not_null, pk) = row?;
        let mut column = Column::new(col_name.as_str(), SqlType::from_declared(&declared));
        column.nullable = !not_null;
        if pk > 0 {
            column = column.primary_key();
        }
        column.foreign_key = fks
            .iter()
            .find(|(from, _)| *from == col_name)
            .map(|(_, fk)| fk.clone());
        columns.push(column);
    }

    Table::new(name, columns)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::engine::create_engine;

    fn tutorial() -> MetaData {
        let mut metadata = MetaData::new();
        let _ = metadata
            .table(
                "user_account",
                vec![
                    Column::new("id", SqlType::Integer).primary_key(),
                    Column::new("name", SqlType::String(Some(30))),
                    Column::new("fullname", SqlType::String(None)),
                ],
            )
            .unwrap();
        let _ = metadata
            .table(
                "address",
                vec![
                    Column::new("id", SqlType::Integer).primary_key(),
                    Column::foreign("user_id", "user_account.id").unwrap().not_null(),
                    Column::new("email_address", SqlType::String(None)).not_null(),
                ],
            )
            .unwrap();
        metadata
    }

    #[test]
    fn create_table_shape() {
        let metadata = tutorial();
        let sql = create_table_sql(&metadata.get("address").unwrap()).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE address (\n\
             \tid INTEGER NOT NULL,\n\
             \tuser_id INTEGER NOT NULL,\n\
             \temail_address VARCHAR NOT NULL,\n\
             \tPRIMARY KEY (id),\n\
             \tFOREIGN KEY(user_id) REFERENCES user_account (id)\n\
             )"
        );
    }

    #[test]
    fn unresolved_foreign_key_type_errors() {
        let table = Table::new(
            "orphan",
            vec![Column::foreign("owner_id", "nowhere.id").unwrap()],
        )
        .unwrap();
        assert_matches!(create_table_sql(&table), Err(DbError::InvalidOperation(_)));
    }

    #[test]
    fn create_all_is_idempotent() {
        let engine = create_engine("sqlite://").unwrap();
        let metadata = tutorial();
        assert_eq!(metadata.create_all(&engine).unwrap(), vec!["user_account", "address"]);
        assert!(metadata.create_all(&engine).unwrap().is_empty());
        assert_eq!(engine.table_names().unwrap(), vec!["address", "user_account"]);
    }

    #[test]
    fn drop_all_removes_dependents_first() {
        let engine = create_engine("sqlite://").unwrap();
        let metadata = tutorial();
        let _ = metadata.create_all(&engine).unwrap();
        assert_eq!(metadata.drop_all(&engine).unwrap(), vec!["address", "user_account"]);
        assert!(engine.table_names().unwrap().is_empty());
    }

    #[test]
    fn reflect_round_trip() {
        let engine = create_engine("sqlite://").unwrap();
        let _ = tutorial().create_all(&engine).unwrap();

        let mut reflected = MetaData::new();
        let users = reflected.reflect_table("user_account", &engine).unwrap();
        let address = reflected.reflect_table("address", &engine).unwrap();

        assert_eq!(users.identity_column(), Some("id"));
        assert_eq!(users.column("name").unwrap().ty, Some(SqlType::String(Some(30))));
        let fk = address.column("user_id").unwrap();
        assert!(fk.is_not_null());
        assert_eq!(
            fk.foreign_key,
            Some(ForeignKey { table: "user_account".into(), column: "id".into() })
        );
    }

    #[test]
    fn reflect_plain_table() {
        let engine = create_engine("sqlite://").unwrap();
        engine
            .begin(|conn| conn.execute(&text("CREATE TABLE some_table (x int, y int)"), ()).map(|_| ()))
            .unwrap();
        let mut metadata = MetaData::new();
        let table = metadata.reflect_table("some_table", &engine).unwrap();
        let names: Vec<&str> = table.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert!(table.primary_key().is_empty());
        assert_eq!(table.column("x").unwrap().ty, Some(SqlType::Integer));
    }

    #[test]
    fn reflect_missing_table() {
        let engine = create_engine("sqlite://").unwrap();
        assert_matches!(
            MetaData::new().reflect_table("ghost", &engine),
            Err(DbError::NoSuchTable(name)) if name == "ghost"
        );
    }
}
