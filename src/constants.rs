/// Collection and variable defaults for the Parkinsons telemonitoring dataset.
/// Every value here can be overridden through `config.toml`.

// Source collection, mutated in place by imputation
pub const SOURCE_COLLECTION: &str = "Samples";

// Derived collections, owned by the batch job and rebuilt on every run
pub const STATISTICS_COLLECTION: &str = "statistics_ParkinsonsData";
pub const FREQUENCY_COLLECTION: &str = "frequency_ParkinsonsData";
pub const LOW_PARTITION_COLLECTION: &str = "statistics1_ParkinsonsDataset";
pub const HIGH_PARTITION_COLLECTION: &str = "statistics2_ParkinsonsDataset";
pub const CATEGORICAL_EMBED_COLLECTION: &str = "emb_ParkinsonsDataset";
pub const STATISTICAL_EMBED_COLLECTION: &str = "emb2_ParkinsonsDataset";

/// Sentinel written into absent continuous fields
pub const MISSING_CONTINUOUS: i64 = -1;
/// Sentinel written into absent categorical fields
pub const MISSING_CATEGORICAL: &str = "empty";

pub const DEFAULT_THRESHOLD_FACTOR: f64 = 1.1;
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_SQLITE_PATH: &str = "data/parkinsons.db";

// Document field names shared by stages and tests
pub const ID_FIELD: &str = "_id";
pub const FLAG_FIELD: &str = "ExcedingValue";
pub const FLAG_VALUE_FIELD: &str = "value";
pub const FREQUENCIES_SUFFIX: &str = "_frequencies";
pub const STATS_SUFFIX: &str = "_stats";

pub const CONTINUOUS_VARIABLES: [&str; 21] = [
    "subject#",
    "age",
    "test_time",
    "motor_UPDRS",
    "total_UPDRS",
    "Jitter(%)",
    "Jitter(Abs)",
    "Jitter:RAP",
    "Jitter:PPQ5",
    "Jitter:DDP",
    "Shimmer",
    "Shimmer(dB)",
    "Shimmer:APQ3",
    "Shimmer:APQ5",
    "Shimmer:APQ11",
    "Shimmer:DDA",
    "NHR",
    "HNR",
    "RPDE",
    "DFA",
    "PPE",
];

pub const CATEGORICAL_VARIABLES: [&str; 1] = ["sex"];

/// Compound index built on the source collection: `age` descending, `sex` ascending
pub const INDEX_KEYS: [(&str, i32); 2] = [("age", -1), ("sex", 1)];

/// Derived collection field name for a categorical variable's frequency table
pub fn frequencies_field(variable: &str) -> String {
    format!("{variable}{FREQUENCIES_SUFFIX}")
}

/// Derived collection field name for a continuous variable's statistics
pub fn stats_field(variable: &str) -> String {
    format!("{variable}{STATS_SUFFIX}")
}
