use clap::Parser;

use sqlite_web::{adapters, cli::Args, core::connection::Database, error::AppResult, logging};

fn main() -> AppResult<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let db = match Database::open(&args.db, args.open_options()) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, path = %args.db.display(), "cannot open database");
            return Err(e);
        }
    };
    adapters::bridge::run(args, db)
}
