use std::env;
use std::io;
use std::process;

use small_base::cli::Cli;
use small_base::{init_log, Database, RuntimeConfig};

/// Start the shell against the database file named on the command line
/// (default `small.db`). The WAL file lives next to it.
fn main() {
    init_log();

    let args: Vec<String> = env::args().collect();
    let db_file = args.get(1).map(|s| s.as_str()).unwrap_or("small.db");

    let config = RuntimeConfig::default();
    let db = match Database::open(db_file, &config) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("{}", e.diagnostic());
            process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let code = Cli::new(db).run(stdin.lock(), &mut stdout);
    process::exit(code);
}
