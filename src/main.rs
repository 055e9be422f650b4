use std::error::Error;

use demandb::db::electricity_demand::Import;
use demandb::db::prod_db::ProdDb;
use log::info;

/// Import the demand CSV into the realtime database.  The parsed table is
/// kept locally when the store cannot be reached.
fn main() -> Result<(), Box<dyn Error>> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let archive = ProdDb::electricity_demand();
    match archive.import("Final 2023.csv")? {
        Import::Written { records } => {
            info!("done, {} records in the store", records.len());
        }
        Import::Unwritten { records, reason } => {
            info!(
                "store not updated ({}), parsed {} records from the file",
                reason,
                records.len()
            );
        }
    }

    Ok(())
}
