use anyhow::Result;

/// Query result with every cell rendered as text.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryTable {
    /// Fixed-width text table, NULLs shown as `-`.
    pub fn render(&self) -> String {
        let cell = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &self.rows {
            for (i, v) in row.iter().enumerate() {
                if let Some(w) = widths.get_mut(i) {
                    *w = (*w).max(cell(v).chars().count());
                }
            }
        }

        let line = |values: Vec<String>| {
            values
                .iter()
                .zip(&widths)
                .map(|(v, w)| format!("{:<width$}", v, width = *w))
                .collect::<Vec<_>>()
                .join(" | ")
                .trim_end()
                .to_string()
        };

        let mut out = vec![line(self.columns.clone())];
        let total = widths.iter().sum::<usize>() + 3 * widths.len().saturating_sub(1);
        out.push("-".repeat(total));
        for row in &self.rows {
            out.push(line(row.iter().map(cell).collect()));
        }
        out.push(format!("({} rows)", self.rows.len()));
        out.join("\n")
    }
}

/// Anything that can run the export statements.
pub trait SqlEngine {
    fn execute(&mut self, sql: &str) -> Result<()>;
    fn query(&mut self, sql: &str) -> Result<QueryTable>;
}

const REDACTED: &str = "<redacted>";

/// Collects statements instead of running them, for dry runs.
#[derive(Debug, Default)]
pub struct ScriptEngine {
    statements: Vec<String>,
    secrets: Vec<String>,
}

impl ScriptEngine {
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// Mask `secret` wherever it appears in [`Self::script`].
    pub fn redact(&mut self, secret: &str) {
        if !secret.is_empty() {
            // statements carry the quote-escaped form
            self.secrets.push(secret.replace('\'', "''"));
        }
    }

    /// Recorded statements as one script, secrets masked.
    pub fn script(&self) -> String {
        let mut script = self
            .statements
            .iter()
            .map(|s| format!("{};", s))
            .collect::<Vec<_>>()
            .join("\n\n");
        for secret in &self.secrets {
            script = script.replace(secret.as_str(), REDACTED);
        }
        script
    }
}

impl SqlEngine for ScriptEngine {
    fn execute(&mut self, sql: &str) -> Result<()> {
        self.statements.push(sql.to_string());
        Ok(())
    }

    fn query(&mut self, sql: &str) -> Result<QueryTable> {
        self.statements.push(sql.to_string());
        Ok(QueryTable::default())
    }
}

#[cfg(feature = "duckdb")]
pub use duck::DuckDbEngine;

#[cfg(feature = "duckdb")]
mod duck {
    use anyhow::{Context, Result};
    use duckdb::types::Value;
    use duckdb::Connection;

    use super::{QueryTable, SqlEngine};

    /// In-process DuckDB.
    pub struct DuckDbEngine {
        conn: Connection,
    }

    impl DuckDbEngine {
        pub fn open_in_memory() -> Result<Self> {
            let conn = Connection::open_in_memory().context("failed to open DuckDB")?;
            Ok(Self { conn })
        }
    }

    fn text(value: Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::Text(s) => Some(s),
            Value::Boolean(b) => Some(b.to_string()),
            Value::Int(n) => Some(n.to_string()),
            Value::BigInt(n) => Some(n.to_string()),
            Value::Double(n) => Some(n.to_string()),
            other => Some(format!("{:?}", other)),
        }
    }

    impl SqlEngine for DuckDbEngine {
        fn execute(&mut self, sql: &str) -> Result<()> {
            self.conn
                .execute_batch(sql)
                .with_context(|| format!("statement failed:\n{}", sql))
        }

        fn query(&mut self, sql: &str) -> Result<QueryTable> {
            let mut stmt = self
                .conn
                .prepare(sql)
                .with_context(|| format!("invalid query:\n{}", sql))?;
            let mut rows = Vec::new();
            {
                let mut result = stmt.query([])?;
                while let Some(row) = result.next()? {
                    let width = row.as_ref().column_count();
                    let mut cells = Vec::with_capacity(width);
                    for i in 0..width {
                        cells.push(text(row.get::<_, Value>(i)?));
                    }
                    rows.push(cells);
                }
            }
            Ok(QueryTable {
                columns: stmt.column_names(),
                rows,
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn runs_queries_in_memory() {
            let mut engine = DuckDbEngine::open_in_memory().unwrap();
            engine
                .execute("CREATE TABLE t AS SELECT 1 AS id, 'a' AS name UNION ALL SELECT 2, NULL")
                .unwrap();
            let table = engine.query("SELECT id, name FROM t ORDER BY id").unwrap();
            assert_eq!(table.columns, vec!["id", "name"]);
            assert_eq!(table.rows[0], vec![Some("1".to_string()), Some("a".to_string())]);
            assert_eq!(table.rows[1][1], None);
        }
    }
}
