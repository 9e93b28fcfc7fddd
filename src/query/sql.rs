//! SQL statements for JSON-mode tables.
//!
//! A JSON-mode table has two columns: `id` (the key) and `data` (the whole
//! entity serialized as JSON). Filters and sort orders address fields inside
//! `data` through [`SqlDialect::json_field`].

/// SQL flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// Microsoft SQL Server (`[ident]`, `@n`, `OFFSET ... FETCH`, `JSON_MODIFY`).
    SqlServer,
    /// `SQLite` (`"ident"`, `?n`, `LIMIT ... OFFSET`, `json_set`).
    Sqlite,
}

impl SqlDialect {
    /// Quotes an identifier.
    #[must_use]
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Self::SqlServer => format!("[{}]", name.replace(']', "]]")),
            Self::Sqlite => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    /// Returns the 1-based positional parameter placeholder.
    #[must_use]
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::SqlServer => format!("@{index}"),
            Self::Sqlite => format!("?{index}"),
        }
    }

    /// Returns an expression reading `field` from the `data` column.
    #[must_use]
    pub fn json_field(self, field: &str) -> String {
        let data = self.quote_identifier("data");
        let path = json_path(field);
        match self {
            Self::SqlServer => format!("JSON_VALUE({data},{path})"),
            Self::Sqlite => format!("json_extract({data},{path})"),
        }
    }

    /// `CREATE TABLE` for a JSON-mode table.
    #[must_use]
    pub fn create_json_table(self, table: &str) -> String {
        let t = self.quote_identifier(table);
        let id = self.quote_identifier("id");
        let data = self.quote_identifier("data");
        match self {
            Self::SqlServer => {
                format!("CREATE TABLE {t} ({id} VARCHAR(32) PRIMARY KEY, {data} NVARCHAR(MAX))")
            },
            Self::Sqlite => {
                format!("CREATE TABLE IF NOT EXISTS {t} ({id} TEXT PRIMARY KEY, {data} TEXT)")
            },
        }
    }

    /// `CREATE INDEX` over JSON fields.
    #[must_use]
    pub fn create_json_index(
        self,
        table: &str,
        name: &str,
        keys: &[(String, bool)],
        unique: bool,
    ) -> String {
        let columns = keys
            .iter()
            .map(|(field, ascending)| {
                let expr = self.json_field(field);
                if *ascending { expr } else { format!("{expr} DESC") }
            })
            .collect::<Vec<_>>()
            .join(",");
        let unique = if unique { "UNIQUE " } else { "" };
        let exists = match self {
            Self::SqlServer => "",
            Self::Sqlite => "IF NOT EXISTS ",
        };
        format!(
            "CREATE {unique}INDEX {exists}{} ON {} ({columns})",
            self.quote_identifier(name),
            self.quote_identifier(table)
        )
    }

    /// Query for table existence; the first column of the first row is
    /// non-null (SQL Server) or non-zero (`SQLite`) when the table exists.
    #[must_use]
    pub fn table_exists(self, table: &str) -> String {
        let literal = table.replace('\'', "''");
        match self {
            Self::SqlServer => format!("SELECT OBJECT_ID('{literal}', 'U') AS oid"),
            Self::Sqlite => format!(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='{literal}'"
            ),
        }
    }

    /// Paged `SELECT` of the `data` column.
    #[must_use]
    pub fn select(
        self,
        table: &str,
        filter: Option<&str>,
        sort: Option<&str>,
        skip: Option<u64>,
        take: Option<u64>,
    ) -> String {
        let mut sql = format!(
            "SELECT {} FROM {}",
            self.quote_identifier("data"),
            self.quote_identifier(table)
        );
        push_where(&mut sql, filter);
        let sort = sort.filter(|s| !s.trim().is_empty());

        match self {
            Self::SqlServer => {
                if let Some(sort) = sort {
                    sql.push_str(" ORDER BY ");
                    sql.push_str(sort);
                } else if skip.is_some() || take.is_some() {
                    sql.push_str(" ORDER BY (SELECT NULL)");
                }
                if skip.is_some() || take.is_some() {
                    sql.push_str(&format!(" OFFSET {} ROWS", skip.unwrap_or(0)));
                    if let Some(take) = take {
                        sql.push_str(&format!(" FETCH NEXT {take} ROWS ONLY"));
                    }
                }
            },
            Self::Sqlite => {
                if let Some(sort) = sort {
                    sql.push_str(" ORDER BY ");
                    sql.push_str(sort);
                }
                match (take, skip) {
                    (Some(take), Some(skip)) => sql.push_str(&format!(" LIMIT {take} OFFSET {skip}")),
                    (Some(take), None) => sql.push_str(&format!(" LIMIT {take}")),
                    (None, Some(skip)) => sql.push_str(&format!(" LIMIT -1 OFFSET {skip}")),
                    (None, None) => {},
                }
            },
        }
        sql
    }

    /// `SELECT COUNT(*)`.
    #[must_use]
    pub fn count(self, table: &str, filter: Option<&str>) -> String {
        let mut sql = format!(
            "SELECT COUNT(*) AS count FROM {}",
            self.quote_identifier(table)
        );
        push_where(&mut sql, filter);
        sql
    }

    /// `DELETE` with an optional filter.
    #[must_use]
    pub fn delete(self, table: &str, filter: Option<&str>) -> String {
        let mut sql = format!("DELETE FROM {}", self.quote_identifier(table));
        push_where(&mut sql, filter);
        sql
    }

    /// `SELECT` of one row by id (parameter 1).
    #[must_use]
    pub fn select_by_id(self, table: &str) -> String {
        format!(
            "SELECT {} FROM {} WHERE {}={}",
            self.quote_identifier("data"),
            self.quote_identifier(table),
            self.quote_identifier("id"),
            self.placeholder(1)
        )
    }

    /// `SELECT` of rows by ids (parameters 1..=count).
    #[must_use]
    pub fn select_by_ids(self, table: &str, count: usize) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} IN ({})",
            self.quote_identifier("data"),
            self.quote_identifier(table),
            self.quote_identifier("id"),
            self.placeholders(1, count)
        )
    }

    /// `DELETE` of one row by id (parameter 1).
    #[must_use]
    pub fn delete_by_id(self, table: &str) -> String {
        format!(
            "DELETE FROM {} WHERE {}={}",
            self.quote_identifier(table),
            self.quote_identifier("id"),
            self.placeholder(1)
        )
    }

    /// `DELETE` of rows by ids (parameters 1..=count).
    #[must_use]
    pub fn delete_by_ids(self, table: &str, count: usize) -> String {
        format!(
            "DELETE FROM {} WHERE {} IN ({})",
            self.quote_identifier(table),
            self.quote_identifier("id"),
            self.placeholders(1, count)
        )
    }

    /// `INSERT` of id (parameter 1) and data (parameter 2).
    #[must_use]
    pub fn insert(self, table: &str) -> String {
        format!(
            "INSERT INTO {} ({},{}) VALUES ({},{})",
            self.quote_identifier(table),
            self.quote_identifier("id"),
            self.quote_identifier("data"),
            self.placeholder(1),
            self.placeholder(2)
        )
    }

    /// Insert-or-replace of id (parameter 1) and data (parameter 2).
    #[must_use]
    pub fn upsert(self, table: &str) -> String {
        let t = self.quote_identifier(table);
        let id = self.quote_identifier("id");
        let data = self.quote_identifier("data");
        let (p1, p2) = (self.placeholder(1), self.placeholder(2));
        match self {
            Self::SqlServer => format!(
                "MERGE {t} AS target USING (SELECT {p1} AS {id}, {p2} AS {data}) AS source \
                 ON target.{id}=source.{id} \
                 WHEN MATCHED THEN UPDATE SET {data}=source.{data} \
                 WHEN NOT MATCHED THEN INSERT ({id},{data}) VALUES (source.{id},source.{data});"
            ),
            Self::Sqlite => format!(
                "INSERT INTO {t} ({id},{data}) VALUES ({p1},{p2}) \
                 ON CONFLICT({id}) DO UPDATE SET {data}=excluded.{data}"
            ),
        }
    }

    /// Full replace of data (parameter 2) for id (parameter 1).
    #[must_use]
    pub fn replace(self, table: &str) -> String {
        format!(
            "UPDATE {} SET {}={} WHERE {}={}",
            self.quote_identifier(table),
            self.quote_identifier("data"),
            self.placeholder(2),
            self.quote_identifier("id"),
            self.placeholder(1)
        )
    }

    /// Partial update of `fields` for id (parameter 1); field values are
    /// parameters 2.. in the order given. `SQLite` expects them as JSON text.
    #[must_use]
    pub fn update_json_fields<S: AsRef<str>>(self, table: &str, fields: &[S]) -> String {
        let data = self.quote_identifier("data");
        let expr = match self {
            Self::SqlServer => fields.iter().enumerate().fold(data.clone(), |acc, (i, f)| {
                format!(
                    "JSON_MODIFY({acc},{},{})",
                    json_path(f.as_ref()),
                    self.placeholder(i + 2)
                )
            }),
            Self::Sqlite => {
                let pairs = fields
                    .iter()
                    .enumerate()
                    .map(|(i, f)| format!("{},json({})", json_path(f.as_ref()), self.placeholder(i + 2)))
                    .collect::<Vec<_>>();
                if pairs.is_empty() {
                    data.clone()
                } else {
                    format!("json_set({data},{})", pairs.join(","))
                }
            },
        };
        format!(
            "UPDATE {} SET {data}={expr} WHERE {}={}",
            self.quote_identifier(table),
            self.quote_identifier("id"),
            self.placeholder(1)
        )
    }

    fn placeholders(self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn json_path(field: &str) -> String {
    format!("'$.{}'", field.replace('\'', "''"))
}

fn push_where(sql: &mut String, filter: Option<&str>) {
    if let Some(filter) = filter.filter(|f| !f.trim().is_empty()) {
        sql.push_str(" WHERE ");
        sql.push_str(filter);
    }
}
