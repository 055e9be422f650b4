// Electricity demand records from a local CSV file, archived in a Firebase
// Realtime Database under one `electricity_demand` node and read back as a
// flat table.  The local file doubles as the fallback whenever the store
// cannot be reached.

use std::cell::OnceCell;
use std::error::Error;
use std::path::Path;

use itertools::Itertools;
use log::{error, info, warn};
use serde_json::{Map, Value};

use crate::db::rtdb::{RtdbClient, RtdbConfig, StoreError};

/// Node that holds all demand records.
const SUBTREE: &str = "electricity_demand";

/// One cell of the demand table.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    /// Parse one CSV cell.  Empty and NaN cells count as missing and
    /// become 0.0.
    fn from_csv(cell: &str) -> Scalar {
        let cell = cell.trim();
        if cell.is_empty() {
            return Scalar::Number(0.0);
        }
        match cell.parse::<f64>() {
            Ok(x) if x.is_nan() => Scalar::Number(0.0),
            Ok(x) => Scalar::Number(x),
            Err(_) => Scalar::Text(cell.to_string()),
        }
    }

    /// The value as it may be persisted.  JSON has no representation for
    /// non-finite numbers, so they go to 0.0.
    pub fn sanitized(&self) -> Scalar {
        match self {
            Scalar::Number(x) if !x.is_finite() => Scalar::Number(0.0),
            other => other.clone(),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Scalar::Number(x) => Value::from(*x),
            Scalar::Text(s) => Value::from(s.as_str()),
        }
    }

    fn from_value(value: &Value) -> Scalar {
        match value {
            Value::Null => Scalar::Number(0.0),
            Value::Number(n) => Scalar::Number(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => Scalar::Text(s.clone()),
            other => Scalar::Text(other.to_string()),
        }
    }
}

/// One row of the demand table: column name -> value, in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Record(Vec<(String, Scalar)>);

impl Record {
    pub fn new(columns: Vec<(String, Scalar)>) -> Record {
        Record(columns)
    }

    pub fn get(&self, column: &str) -> Option<&Scalar> {
        self.0
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of the record with every value fit for the wire format.
    pub fn sanitized(&self) -> Record {
        Record(
            self.0
                .iter()
                .map(|(name, value)| (name.clone(), value.sanitized()))
                .collect(),
        )
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (name, value) in &self.0 {
            map.insert(name.clone(), value.to_value());
        }
        Value::Object(map)
    }

    fn from_value(value: &Value) -> Option<Record> {
        let map = value.as_object()?;
        Some(Record(
            map.iter()
                .map(|(name, value)| (name.clone(), Scalar::from_value(value)))
                .collect(),
        ))
    }
}

/// Read a comma delimited file with a header row into records.  Missing
/// cells become 0.0.
pub fn read_demand_csv(path: &Path) -> Result<Vec<Record>, Box<dyn Error>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.to_string()).collect();
    let mut records: Vec<Record> = Vec::new();
    for result in rdr.records() {
        let row = result?;
        let columns = headers
            .iter()
            .cloned()
            .zip(row.iter().map(Scalar::from_csv))
            .collect();
        records.push(Record(columns));
    }
    Ok(records)
}

/// Outcome of an import run.
#[derive(Debug)]
pub enum Import {
    /// All records were written to the store.
    Written { records: Vec<Record> },
    /// The store was unavailable.  The records were parsed but left
    /// unwritten.
    Unwritten {
        records: Vec<Record>,
        reason: StoreError,
    },
}

impl Import {
    pub fn records(&self) -> &[Record] {
        match self {
            Import::Written { records } => records,
            Import::Unwritten { records, .. } => records,
        }
    }

    pub fn into_records(self) -> Vec<Record> {
        match self {
            Import::Written { records } => records,
            Import::Unwritten { records, .. } => records,
        }
    }
}

/// Why a retrieval fell back to the local file.
#[derive(Debug)]
pub enum FallbackReason {
    /// No connection to the store could be established.
    Connect(StoreError),
    /// The store was reachable but the fetch failed.
    Fetch(StoreError),
    /// The store was reachable but held no records.
    Empty,
}

/// Where retrieved records came from.
#[derive(Debug)]
pub enum Source {
    Store,
    LocalFile(FallbackReason),
}

#[derive(Debug)]
pub struct Retrieval {
    pub records: Vec<Record>,
    pub source: Source,
}

pub struct ElectricityDemandArchive {
    config: RtdbConfig,
    /// Local file used for the import and as the fallback on reads.
    fallback_path: String,
    client: OnceCell<RtdbClient>,
}

impl ElectricityDemandArchive {
    pub fn new<S: Into<String>>(config: RtdbConfig, fallback_path: S) -> ElectricityDemandArchive {
        ElectricityDemandArchive {
            config,
            fallback_path: fallback_path.into(),
            client: OnceCell::new(),
        }
    }

    /// Connect to the store.  A second call reuses the existing connection
    /// instead of initializing again.
    fn client(&self) -> Result<&RtdbClient, StoreError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = RtdbClient::connect(&self.config)?;
        Ok(self.client.get_or_init(|| client))
    }

    /// Parse the CSV file at `csv_path` and overwrite the store's demand
    /// subtree with its records, keyed `record_<index>` by file position.
    ///
    /// If the store cannot be reached or the write fails, the parsed
    /// records are returned unwritten together with the reason.  Only a
    /// failure to read the file itself is an error.
    pub fn import<P: AsRef<Path>>(&self, csv_path: P) -> Result<Import, Box<dyn Error>> {
        let records = read_demand_csv(csv_path.as_ref())?;

        let client = match self.client() {
            Ok(client) => client,
            Err(reason) => {
                error!("{}", reason);
                warn!("using the CSV file directly since the store connection failed");
                return Ok(Import::Unwritten { records, reason });
            }
        };

        info!("uploading {} records to {} ...", records.len(), SUBTREE);
        match client.put(SUBTREE, &subtree_payload(&records)) {
            Ok(()) => {
                info!(
                    "imported {} records into project {}",
                    records.len(),
                    client.project_id()
                );
                Ok(Import::Written { records })
            }
            Err(reason) => {
                error!("{}", reason);
                Ok(Import::Unwritten { records, reason })
            }
        }
    }

    /// Fetch all demand records from the store.  Falls back to the local
    /// file when the store is unreachable, the fetch fails, or the subtree
    /// is empty; the returned source says which one happened.
    pub fn retrieve(&self) -> Result<Retrieval, Box<dyn Error>> {
        let client = match self.client() {
            Ok(client) => client,
            Err(reason) => {
                error!("{}", reason);
                info!(
                    "using {} directly since the store connection failed",
                    self.fallback_path
                );
                return self.from_fallback(FallbackReason::Connect(reason));
            }
        };

        let subtree = match client.get(SUBTREE) {
            Ok(value) => value,
            Err(reason) => {
                error!("{}", reason);
                return self.from_fallback(FallbackReason::Fetch(reason));
            }
        };

        match subtree.as_object() {
            Some(children) if !children.is_empty() => Ok(Retrieval {
                records: records_from_subtree(children),
                source: Source::Store,
            }),
            _ => {
                warn!(
                    "no data found under {}, using {} as fallback",
                    SUBTREE, self.fallback_path
                );
                self.from_fallback(FallbackReason::Empty)
            }
        }
    }

    fn from_fallback(&self, reason: FallbackReason) -> Result<Retrieval, Box<dyn Error>> {
        let records = read_demand_csv(Path::new(&self.fallback_path))?;
        Ok(Retrieval {
            records,
            source: Source::LocalFile(reason),
        })
    }
}

/// The whole subtree as written to the store: one child per record, keyed
/// by the record's position in the source file.
fn subtree_payload(records: &[Record]) -> Value {
    let mut children = Map::new();
    for (idx, record) in records.iter().enumerate() {
        children.insert(format!("record_{}", idx), record.sanitized().to_value());
    }
    Value::Object(children)
}

/// Drop the `record_<index>` keys and rebuild the rows, ordered by index.
/// Children that are not flat objects are skipped.
fn records_from_subtree(children: &Map<String, Value>) -> Vec<Record> {
    children
        .iter()
        .sorted_by_key(|(key, _)| record_index(key))
        .filter_map(|(_, value)| Record::from_value(value))
        .collect()
}

/// Numeric part of a `record_<index>` key.  Keys in any other shape sort
/// last.
fn record_index(key: &str) -> usize {
    key.strip_prefix("record_")
        .and_then(|idx| idx.parse().ok())
        .unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::io::Write;

    use serde_json::json;
    use tempfile::{NamedTempFile, TempDir};

    use crate::db::prod_db::ProdDb;

    use super::*;

    fn demand_csv() -> Result<NamedTempFile, Box<dyn Error>> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "timestamp,demand")?;
        writeln!(file, "2023-01-01 00:00,16500.5")?;
        writeln!(file, "2023-01-01 01:00,")?;
        writeln!(file, "2023-01-01 02:00,15980.25")?;
        Ok(file)
    }

    fn unreachable_archive(fallback_path: &str) -> ElectricityDemandArchive {
        let config = RtdbConfig {
            credentials_path: "/nonexistent/firebase-credentials.json".to_string(),
            database_url: "https://electricity-a1e47-default-rtdb.firebaseio.com".to_string(),
        };
        ElectricityDemandArchive::new(config, fallback_path)
    }

    #[test]
    fn parse_csv_fills_missing_with_zero() -> Result<(), Box<dyn Error>> {
        let file = demand_csv()?;
        let records = read_demand_csv(file.path())?;
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[0].get("timestamp"),
            Some(&Scalar::Text("2023-01-01 00:00".to_string()))
        );
        assert_eq!(records[0].get("demand"), Some(&Scalar::Number(16500.5)));
        assert_eq!(records[1].get("demand"), Some(&Scalar::Number(0.0)));
        assert_eq!(records[2].get("demand"), Some(&Scalar::Number(15980.25)));
        Ok(())
    }

    #[test]
    fn parse_csv_keeps_column_order() -> Result<(), Box<dyn Error>> {
        let file = demand_csv()?;
        let records = read_demand_csv(file.path())?;
        let columns: Vec<&str> = records[0].columns().collect();
        assert_eq!(columns, vec!["timestamp", "demand"]);
        Ok(())
    }

    #[test]
    fn sanitize_replaces_non_finite_values() {
        let record = Record::new(vec![
            ("demand".to_string(), Scalar::Number(f64::NAN)),
            ("peak".to_string(), Scalar::Number(f64::INFINITY)),
            ("zone".to_string(), Scalar::Text("quebec".to_string())),
            ("load".to_string(), Scalar::Number(1250.75)),
        ]);
        let clean = record.sanitized();
        assert_eq!(clean.get("demand"), Some(&Scalar::Number(0.0)));
        assert_eq!(clean.get("peak"), Some(&Scalar::Number(0.0)));
        assert_eq!(clean.get("zone"), Some(&Scalar::Text("quebec".to_string())));
        assert_eq!(clean.get("load"), Some(&Scalar::Number(1250.75)));
    }

    #[test]
    fn record_round_trips_through_wire_format() {
        let record = Record::new(vec![
            ("timestamp".to_string(), Scalar::Text("2023-06-15 17:00".to_string())),
            ("demand".to_string(), Scalar::Number(21034.0)),
        ]);
        let back = Record::from_value(&record.to_value()).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn payload_is_keyed_by_position() -> Result<(), Box<dyn Error>> {
        let file = demand_csv()?;
        let records = read_demand_csv(file.path())?;
        let payload = subtree_payload(&records);
        let children = payload.as_object().unwrap();
        let keys: Vec<&String> = children.keys().collect();
        assert_eq!(keys, vec!["record_0", "record_1", "record_2"]);
        assert_eq!(children["record_1"]["demand"], json!(0.0));
        Ok(())
    }

    #[test]
    fn subtree_records_sort_by_index_not_lexicographically() {
        let value = json!({
            "record_10": {"timestamp": "c", "demand": 3.0},
            "record_2": {"timestamp": "b", "demand": 2.0},
            "record_0": {"timestamp": "a", "demand": 1.0},
        });
        let records = records_from_subtree(value.as_object().unwrap());
        let timestamps: Vec<&Scalar> =
            records.iter().map(|r| r.get("timestamp").unwrap()).collect();
        assert_eq!(
            timestamps,
            vec![
                &Scalar::Text("a".to_string()),
                &Scalar::Text("b".to_string()),
                &Scalar::Text("c".to_string())
            ]
        );
    }

    #[test]
    fn import_without_store_returns_parsed_table() -> Result<(), Box<dyn Error>> {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .is_test(true)
            .try_init();
        let file = demand_csv()?;
        let archive = unreachable_archive(file.path().to_str().unwrap());
        match archive.import(file.path())? {
            Import::Unwritten { records, reason } => {
                assert_eq!(records.len(), 3);
                assert_eq!(records[1].get("demand"), Some(&Scalar::Number(0.0)));
                assert!(matches!(reason, StoreError::CredentialsNotFound(_)));
            }
            Import::Written { .. } => panic!("no store to write to"),
        }
        Ok(())
    }

    #[test]
    fn import_with_unreadable_csv_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.csv");
        let archive = unreachable_archive(missing.to_str().unwrap());
        assert!(archive.import(&missing).is_err());
    }

    #[test]
    fn retrieve_falls_back_when_connection_fails() -> Result<(), Box<dyn Error>> {
        let file = demand_csv()?;
        let archive = unreachable_archive(file.path().to_str().unwrap());
        let retrieval = archive.retrieve()?;
        assert_eq!(retrieval.records.len(), 3);
        assert!(matches!(
            retrieval.source,
            Source::LocalFile(FallbackReason::Connect(StoreError::CredentialsNotFound(_)))
        ));
        Ok(())
    }

    #[test]
    fn connect_is_idempotent() -> Result<(), Box<dyn Error>> {
        let mut key_file = NamedTempFile::new()?;
        writeln!(
            key_file,
            r#"{{"project_id": "electricity-a1e47", "client_email": "loader@electricity-a1e47.iam.gserviceaccount.com"}}"#
        )?;
        let config = RtdbConfig {
            credentials_path: key_file.path().to_str().unwrap().to_string(),
            database_url: "https://electricity-a1e47-default-rtdb.firebaseio.com".to_string(),
        };
        let archive = ElectricityDemandArchive::new(config, "Final 2023.csv");
        let first = archive.client()? as *const RtdbClient;
        let second = archive.client()? as *const RtdbClient;
        assert_eq!(first, second);
        Ok(())
    }

    #[ignore]
    #[test]
    fn import_then_retrieve() -> Result<(), Box<dyn Error>> {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .is_test(true)
            .try_init();
        let file = demand_csv()?;
        let archive = ProdDb::electricity_demand();
        let imported = archive.import(file.path())?;
        assert!(matches!(imported, Import::Written { .. }));

        let retrieval = archive.retrieve()?;
        assert!(matches!(retrieval.source, Source::Store));
        assert_eq!(retrieval.records.len(), 3);
        assert_eq!(retrieval.records[1].get("demand"), Some(&Scalar::Number(0.0)));
        assert_eq!(
            retrieval.records[0].get("demand"),
            Some(&Scalar::Number(16500.5))
        );
        Ok(())
    }
}
