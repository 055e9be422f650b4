use std::error::Error;

use demandb::db::electricity_demand::{FallbackReason, Source};
use demandb::db::prod_db::ProdDb;
use log::info;

/// Read back the demand table, from the store when it is reachable and
/// from the local CSV file otherwise.
fn main() -> Result<(), Box<dyn Error>> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let archive = ProdDb::electricity_demand();
    let retrieval = archive.retrieve()?;
    match retrieval.source {
        Source::Store => info!("{} records from the store", retrieval.records.len()),
        Source::LocalFile(FallbackReason::Empty) => info!(
            "store is empty, {} records from the local file",
            retrieval.records.len()
        ),
        Source::LocalFile(reason) => info!(
            "{} records from the local file ({:?})",
            retrieval.records.len(),
            reason
        ),
    }

    if let Some(first) = retrieval.records.first() {
        let columns: Vec<&str> = first.columns().collect();
        info!("columns: {}", columns.join(", "));
    }

    Ok(())
}
