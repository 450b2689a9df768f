//! Column family definitions for the RocksDB state store
//!
//! Each column family provides logical separation of data types
//! while sharing the same RocksDB instance.

/// Column family for backend records (JSON)
pub const CF_RECORDS: &str = "records";

/// Column family for index definitions (bincode) and index entries
pub const CF_INDEXES: &str = "indexes";

/// Column family for audit records (JSON)
pub const CF_AUDIT: &str = "audit";

/// Column family for async run status reports (JSON)
pub const CF_RUNS: &str = "runs";

/// All column family names
pub const ALL_CFS: &[&str] = &[CF_RECORDS, CF_INDEXES, CF_AUDIT, CF_RUNS];

/// Key prefixes for compound keys
pub mod keys {
    /// Prefix of every record in `table`
    pub fn record_prefix(table: &str) -> String {
        format!("rec:{}:", table)
    }

    pub fn record(table: &str, id: &str) -> String {
        format!("rec:{}:{}", table, id)
    }

    pub fn index_definition(name: &str) -> String {
        format!("def:{}", name)
    }

    /// Prefix of every entry of index `name`
    pub fn index_prefix(name: &str) -> String {
        format!("idx:{}:", name)
    }

    /// Prefix of the entries of index `name` whose field equals `value`
    pub fn index_value_prefix(name: &str, value: &str) -> String {
        format!("idx:{}:{}\u{0}", name, value)
    }

    pub fn index_entry(name: &str, value: &str, id: &str) -> String {
        format!("{}{}", index_value_prefix(name, value), id)
    }

    pub fn audit(run_id: &str) -> String {
        format!("audit:{}", run_id)
    }

    pub fn run(request_id: &str) -> String {
        format!("run:{}", request_id)
    }

    /// Record id from an index entry key
    pub fn parse_index_entry(key: &str) -> Option<&str> {
        key.split_once('\u{0}').map(|(_, id)| id)
    }
}
