//! The interactive shell: meta commands starting with `.`, everything
//! else accumulated until a terminating `;` (with `BEGIN ... END` blocks
//! kept together) and dispatched as SQL.

use std::fs;
use std::io::{BufRead, Write};

use itertools::Itertools;
use log::info;

use crate::config::PAGE_SIZE;
use crate::database::Database;
use crate::error::SmallError;
use crate::executor::QueryResult;
use crate::storage::page_format;
use crate::types::INVALID_PAGE_ID;

const DEFAULT_USER: &str = "root";

pub struct Cli {
    db: Database,
    current_user: String,
    known_users: Vec<String>,
}

enum MetaOutcome {
    Continue,
    Exit,
}

impl Cli {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            current_user: DEFAULT_USER.to_string(),
            known_users: vec![DEFAULT_USER.to_string()],
        }
    }

    /// Drive the REPL until `.exit` or end of input. Returns the process
    /// exit code.
    pub fn run<R: BufRead, W: Write>(&mut self, input: R, output: &mut W) -> i32 {
        let mut buffer = String::new();
        let mut block_depth = 0usize;

        for line in input.lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    let _ = writeln!(output, "IoError: {}", e);
                    return 1;
                }
            };
            let trimmed = line.trim();

            if buffer.is_empty() && trimmed.starts_with('.') {
                match self.handle_meta(trimmed, output) {
                    MetaOutcome::Continue => continue,
                    MetaOutcome::Exit => return 0,
                }
            }

            if trimmed.is_empty() && buffer.is_empty() {
                continue;
            }

            buffer.push_str(&line);
            buffer.push('\n');
            block_depth = block_depth
                .saturating_add(count_keyword(trimmed, "BEGIN"))
                .saturating_sub(count_keyword(trimmed, "END"));

            if block_depth == 0 && trimmed.ends_with(';') {
                let sql = buffer.trim().trim_end_matches(';').to_string();
                buffer.clear();
                if !sql.is_empty() {
                    self.dispatch_sql(&sql, output);
                }
            }
        }
        0
    }

    fn dispatch_sql<W: Write>(&self, sql: &str, output: &mut W) {
        match self.db.run_sql(sql, &self.current_user) {
            Ok(result) => print_result(&result, output),
            Err(e) => {
                let _ = writeln!(output, "{}", e.diagnostic());
            }
        }
    }

    fn handle_meta<W: Write>(&mut self, line: &str, output: &mut W) -> MetaOutcome {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");
        let argument = parts.next().map(|s| s.to_string());

        match command {
            ".exit" => return MetaOutcome::Exit,
            ".help" => {
                let _ = writeln!(
                    output,
                    "meta commands:\n\
                     .help            show this help\n\
                     .login <user>    switch the active user\n\
                     .logout          return to {}\n\
                     .info            storage statistics\n\
                     .users           users seen this session\n\
                     .dump <path>     page-level report of the database file\n\
                     .export <path>   write the database as replayable SQL\n\
                     .import <path>   replay a SQL script\n\
                     .exit            quit\n\
                     anything else ending in ';' runs as SQL",
                    DEFAULT_USER
                );
            }
            ".login" => match argument {
                Some(user) => {
                    if !self.known_users.contains(&user) {
                        self.known_users.push(user.clone());
                    }
                    info!("user {} logged in", user);
                    self.current_user = user;
                    let _ = writeln!(output, "now acting as {}", self.current_user);
                }
                None => {
                    let _ = writeln!(output, "usage: .login <user>");
                }
            },
            ".logout" => {
                self.current_user = DEFAULT_USER.to_string();
                let _ = writeln!(output, "now acting as {}", self.current_user);
            }
            ".users" => {
                for user in &self.known_users {
                    let marker = if *user == self.current_user { "*" } else { " " };
                    let _ = writeln!(output, "{} {}", marker, user);
                }
            }
            ".info" => {
                let stats = self.db.engine().stats();
                let _ = writeln!(
                    output,
                    "pages: {}\ndisk reads: {}\ndisk writes: {}\npool: {} frames ({} free)\n\
                     hit rate: {:.2} ({} / {})\nreplacements: {}\nwritebacks: {}\nwal bytes: {}",
                    stats.num_pages,
                    stats.disk_reads,
                    stats.disk_writes,
                    stats.pool_size,
                    stats.free_frames,
                    stats.hit_rate,
                    stats.hits,
                    stats.accesses,
                    stats.replacements,
                    stats.writebacks,
                    stats.wal_bytes,
                );
            }
            ".dump" => match argument {
                Some(path) => match self.dump_pages(&path) {
                    Ok(pages) => {
                        let _ = writeln!(output, "dumped {} pages to {}", pages, path);
                    }
                    Err(e) => {
                        let _ = writeln!(output, "{}", e.diagnostic());
                    }
                },
                None => {
                    let _ = writeln!(output, "usage: .dump <path>");
                }
            },
            ".export" => match argument {
                Some(path) => match self.export_sql(&path) {
                    Ok(statements) => {
                        let _ = writeln!(output, "exported {} statements to {}", statements, path);
                    }
                    Err(e) => {
                        let _ = writeln!(output, "{}", e.diagnostic());
                    }
                },
                None => {
                    let _ = writeln!(output, "usage: .export <path>");
                }
            },
            ".import" => match argument {
                Some(path) => self.import_sql(&path, output),
                None => {
                    let _ = writeln!(output, "usage: .import <path>");
                }
            },
            other => {
                let _ = writeln!(output, "unknown command {} (try .help)", other);
            }
        }
        MetaOutcome::Continue
    }

    /// Write a per-page report of the database file: header fields plus a
    /// short hex preview of the payload.
    fn dump_pages(&self, path: &str) -> Result<usize, SmallError> {
        let disk = self.db.engine().disk();
        let pages = disk.num_pages();
        let mut out = String::new();

        let mut buf = vec![0u8; PAGE_SIZE];
        for page_id in 0..pages {
            disk.read_page(page_id, &mut buf)?;
            let header = page_format::read_header(&buf);
            let type_name = page_format::PageType::from_u32(header.page_type)
                .map(|t| t.name())
                .unwrap_or("unknown");
            let next = if header.next_page_id == INVALID_PAGE_ID {
                "-".to_string()
            } else {
                header.next_page_id.to_string()
            };
            out.push_str(&format!(
                "page {:>4}  type={:<8} slots={:<5} free_off={:<5} next={:<5} | {}\n",
                page_id,
                type_name,
                header.slot_count,
                header.free_space_offset,
                next,
                hex::encode(&buf[page_format::PAGE_HEADER_SIZE..page_format::PAGE_HEADER_SIZE + 16]),
            ));
        }

        fs::write(path, out)?;
        Ok(pages as usize)
    }

    /// Serialize the catalog and every table's rows as replayable SQL.
    fn export_sql(&self, path: &str) -> Result<usize, SmallError> {
        let mut statements = Vec::new();

        for table in self.db.catalog().get_all_tables() {
            let columns = table
                .columns
                .iter()
                .map(|c| {
                    let mut def = format!("{} {}", c.name, c.ctype);
                    if c.primary_key {
                        def.push_str(" PRIMARY KEY");
                    }
                    if c.unique {
                        def.push_str(" UNIQUE");
                    }
                    if c.not_null && !c.primary_key {
                        def.push_str(" NOT NULL");
                    }
                    if let Some(default) = &c.default_value {
                        def.push_str(&format!(" DEFAULT {}", quote_literal(default, c.ctype.is_numeric())));
                    }
                    def
                })
                .join(", ");
            statements.push(format!("CREATE TABLE {}({});", table.table_name, columns));

            let result = self
                .db
                .run_sql(&format!("SELECT * FROM {}", table.table_name), DEFAULT_USER)?;
            if let QueryResult::Rows { rows, .. } = result {
                for row in rows {
                    let values = table
                        .columns
                        .iter()
                        .map(|c| {
                            quote_literal(row.get(&c.name).unwrap_or(""), c.ctype.is_numeric())
                        })
                        .join(",");
                    statements.push(format!(
                        "INSERT INTO {} VALUES ({});",
                        table.table_name, values
                    ));
                }
            }

            for index in self.db.catalog().get_indexes_for_table(&table.table_name) {
                statements.push(format!(
                    "CREATE INDEX {} ON {}({});",
                    index.index_name,
                    index.table_name,
                    index.columns.join(", ")
                ));
            }
        }

        fs::write(path, statements.join("\n") + "\n")?;
        Ok(statements.len())
    }

    /// Replay a SQL script. One failing statement does not stop the rest;
    /// each failure is reported on its own line.
    fn import_sql<W: Write>(&self, path: &str, output: &mut W) {
        let script = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                let _ = writeln!(output, "IoError: {}", e);
                return;
            }
        };

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for statement in split_statements(&script) {
            match self.db.run_sql(&statement, &self.current_user) {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    failed += 1;
                    let _ = writeln!(output, "{}", e.diagnostic());
                }
            }
        }
        let _ = writeln!(output, "import: {} ok, {} failed", succeeded, failed);
    }
}

fn print_result<W: Write>(result: &QueryResult, output: &mut W) {
    match result {
        QueryResult::Summary(text) => {
            let _ = writeln!(output, "{}", text);
        }
        QueryResult::Rows { columns, rows } => {
            let _ = writeln!(output, "{}", columns.join(" | "));
            for row in rows {
                let _ = writeln!(output, "{}", row.texts().join(" | "));
            }
            let _ = writeln!(
                output,
                "({} row{})",
                rows.len(),
                if rows.len() == 1 { "" } else { "s" }
            );
        }
    }
}

fn quote_literal(text: &str, numeric: bool) -> String {
    if numeric {
        text.to_string()
    } else {
        format!("'{}'", text.replace('\'', "''"))
    }
}

/// Split a script on `;` boundaries, leaving quoted strings intact.
fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_string = false;

    for c in script.chars() {
        match c {
            '\'' => {
                in_string = !in_string;
                current.push(c);
            }
            ';' if !in_string => {
                let text = current.trim().to_string();
                if !text.is_empty() {
                    statements.push(text);
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let tail = current.trim().to_string();
    if !tail.is_empty() {
        statements.push(tail);
    }
    statements
}

fn count_keyword(line: &str, keyword: &str) -> usize {
    line.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|word| word.eq_ignore_ascii_case(keyword))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements() {
        let script = "CREATE TABLE t(a INT);\nINSERT INTO t VALUES (1);\n";
        assert_eq!(
            split_statements(script),
            vec!["CREATE TABLE t(a INT)", "INSERT INTO t VALUES (1)"]
        );
    }

    #[test]
    fn test_split_keeps_quoted_semicolons() {
        let script = "INSERT INTO t VALUES ('a;b');INSERT INTO t VALUES ('c')";
        assert_eq!(split_statements(script).len(), 2);
    }

    #[test]
    fn test_count_keyword() {
        assert_eq!(count_keyword("BEGIN", "BEGIN"), 1);
        assert_eq!(count_keyword("begin end", "END"), 1);
        assert_eq!(count_keyword("ENDING", "END"), 0);
    }
}
