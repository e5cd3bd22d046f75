use blobcache::schema;
use rusqlite::Connection;

const INIT_PAGE_SIZE: u32 = 1 << 14;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("init") => {
            let path = args.get(2).ok_or("init requires a database path")?;
            if args.len() > 3 {
                return Err("init takes exactly one path".into());
            }
            let conn =
                Connection::open(path).map_err(|e| format!("opening {path}: {e}"))?;
            schema::init_schema(&conn, INIT_PAGE_SIZE, true)
                .map_err(|e| format!("initializing schema at {path}: {e}"))?;
            Ok(())
        }
        Some(other) => {
            print_usage();
            Err(format!("unknown command: {other}"))
        }
        None => {
            print_usage();
            Err("missing command".into())
        }
    }
}

fn print_usage() {
    eprintln!("usage: blobcache init <path>");
}
