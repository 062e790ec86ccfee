use crate::constants;
use crate::error::{EtlError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// A stored document. Every document held by a store carries an `_id`.
pub type Document = Map<String, Value>;

/// A continuous variable and its 1-based position in the variable list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousVariable {
    pub name: String,
    pub ordinal: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoricalVariable {
    pub name: String,
}

/// Ordered variable descriptors passed through every stage.
///
/// Stages iterate `continuous()` in list order; nothing depends on map
/// iteration order or on a counter kept outside this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSet {
    continuous: Vec<ContinuousVariable>,
    categorical: Vec<CategoricalVariable>,
}

impl VariableSet {
    pub fn new<C, K>(continuous: C, categorical: K) -> Result<Self>
    where
        C: IntoIterator,
        C::Item: Into<String>,
        K: IntoIterator,
        K::Item: Into<String>,
    {
        let continuous: Vec<ContinuousVariable> = continuous
            .into_iter()
            .enumerate()
            .map(|(i, name)| ContinuousVariable {
                name: name.into(),
                ordinal: i + 1,
            })
            .collect();
        let categorical: Vec<CategoricalVariable> = categorical
            .into_iter()
            .map(|name| CategoricalVariable { name: name.into() })
            .collect();

        let mut seen = HashSet::new();
        let names = continuous
            .iter()
            .map(|v| v.name.as_str())
            .chain(categorical.iter().map(|v| v.name.as_str()));
        for name in names {
            if name.trim().is_empty() {
                return Err(EtlError::Config("variable names must not be empty".to_string()));
            }
            if !seen.insert(name) {
                return Err(EtlError::Config(format!("variable '{name}' is listed more than once")));
            }
        }

        Ok(Self {
            continuous,
            categorical,
        })
    }

    /// The 21 continuous variables and the `sex` categorical variable
    pub fn parkinsons() -> Self {
        Self {
            continuous: constants::CONTINUOUS_VARIABLES
                .iter()
                .enumerate()
                .map(|(i, name)| ContinuousVariable {
                    name: name.to_string(),
                    ordinal: i + 1,
                })
                .collect(),
            categorical: constants::CATEGORICAL_VARIABLES
                .iter()
                .map(|name| CategoricalVariable {
                    name: name.to_string(),
                })
                .collect(),
        }
    }

    pub fn continuous(&self) -> &[ContinuousVariable] {
        &self.continuous
    }

    pub fn categorical(&self) -> &[CategoricalVariable] {
        &self.categorical
    }
}

/// Output of the engine's grouped aggregation over one scalar field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldAggregate {
    /// Average over numeric values; `None` when there are none
    pub mean: Option<f64>,
    /// Sample (N-1) standard deviation; `None` when fewer than two numeric values
    pub stddev: Option<f64>,
    /// Number of documents in the group
    pub count: u64,
}

/// One record per continuous variable, keyed by variable name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableStatistic {
    pub variable: String,
    pub ordinal: usize,
    pub mean: Option<f64>,
    pub stddev: Option<f64>,
    pub count: u64,
}

impl VariableStatistic {
    pub fn from_aggregate(variable: &ContinuousVariable, aggregate: FieldAggregate) -> Self {
        Self {
            variable: variable.name.clone(),
            ordinal: variable.ordinal,
            mean: aggregate.mean,
            stddev: aggregate.stddev,
            count: aggregate.count,
        }
    }

    pub fn to_document(&self) -> Result<Document> {
        let mut doc = into_document(self)?;
        doc.insert(
            constants::ID_FIELD.to_string(),
            Value::String(self.variable.clone()),
        );
        Ok(doc)
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(doc.clone()))?)
    }
}

/// Statistics sub-record embedded as `<variable>_stats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedStats {
    pub average: Option<f64>,
    #[serde(rename = "standardDeviation")]
    pub standard_deviation: Option<f64>,
    #[serde(rename = "nonMissingCount")]
    pub non_missing_count: u64,
}

impl EmbeddedStats {
    /// `standardDeviation > factor * average`; false when either side is undefined
    pub fn exceeds(&self, factor: f64) -> bool {
        match (self.standard_deviation, self.average) {
            (Some(sd), Some(avg)) => sd > factor * avg,
            _ => false,
        }
    }

    /// Same comparison with an undefined side read as 0, so a lone record
    /// with a negative average still flags
    pub fn exceeds_null_as_zero(&self, factor: f64) -> bool {
        self.standard_deviation.unwrap_or(0.0) > factor * self.average.unwrap_or(0.0)
    }
}

impl From<&VariableStatistic> for EmbeddedStats {
    fn from(stat: &VariableStatistic) -> Self {
        Self {
            average: stat.mean,
            standard_deviation: stat.stddev,
            non_missing_count: stat.count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketSide {
    Low,
    High,
}

impl BucketSide {
    /// Ties go to the low side
    pub fn classify(value: f64, mean: f64) -> Self {
        if value <= mean {
            BucketSide::Low
        } else {
            BucketSide::High
        }
    }
}

/// Values of one variable on one side of its mean
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionBucket {
    pub variable: String,
    pub mean_value: Option<f64>,
    pub count: u64,
    pub values: Vec<Value>,
}

impl PartitionBucket {
    pub fn empty(variable: &str, mean_value: Option<f64>) -> Self {
        Self {
            variable: variable.to_string(),
            mean_value,
            count: 0,
            values: Vec::new(),
        }
    }

    pub fn push(&mut self, value: Value) {
        self.values.push(value);
        self.count += 1;
    }

    pub fn to_document(&self) -> Result<Document> {
        into_document(self)
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(doc.clone()))?)
    }
}

/// How the threshold stage records its per-variable test results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdFlagMode {
    /// Single `ExcedingValue.value`, overwritten per variable so the last one wins
    LastVariable,
    /// `ExcedingValue.<variable>` for every continuous variable
    #[default]
    PerVariable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn from_direction(direction: i32) -> Result<Self> {
        match direction {
            1 => Ok(SortOrder::Ascending),
            -1 => Ok(SortOrder::Descending),
            other => Err(EtlError::Config(format!(
                "index direction must be 1 or -1, got {other}"
            ))),
        }
    }

    pub fn direction(self) -> i32 {
        match self {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexKey {
    pub field: String,
    pub order: SortOrder,
}

/// A compound index definition, named after its keys (`age_-1_sex_1`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<IndexKey>,
}

impl IndexSpec {
    pub fn new(keys: Vec<IndexKey>) -> Self {
        let name = keys
            .iter()
            .map(|k| format!("{}_{}", k.field, k.order.direction()))
            .collect::<Vec<_>>()
            .join("_");
        Self { name, keys }
    }
}

/// Numeric view of a field value; non-numbers are ignored by aggregation
pub fn numeric(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Textual key under which a categorical value is counted.
///
/// Null yields `None`. Integral floats render without a fraction so that
/// `1` and `1.0` land on the same counter.
pub fn category_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                let f = n.as_f64()?;
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    Some(format!("{}", f as i64))
                } else {
                    Some(f.to_string())
                }
            }
        }
        other => Some(other.to_string()),
    }
}

fn into_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(EtlError::Config(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_variable_set_assigns_ordinals_in_list_order() {
        let vars = VariableSet::new(["age", "test_time"], ["sex"]).unwrap();
        assert_eq!(vars.continuous()[0].ordinal, 1);
        assert_eq!(vars.continuous()[1].name, "test_time");
        assert_eq!(vars.continuous()[1].ordinal, 2);
        assert_eq!(vars.categorical()[0].name, "sex");
    }

    #[test]
    fn test_variable_set_rejects_duplicates() {
        let err = VariableSet::new(["age", "age"], ["sex"]).unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));

        let err = VariableSet::new(["sex"], ["sex"]).unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
    }

    #[test]
    fn test_parkinsons_defaults() {
        let vars = VariableSet::parkinsons();
        assert_eq!(vars.continuous().len(), 21);
        assert_eq!(vars.continuous()[1].name, "age");
        assert_eq!(vars.continuous()[20].ordinal, 21);
        assert_eq!(vars.categorical().len(), 1);
    }

    #[test]
    fn test_bucket_side_tie_goes_low() {
        assert_eq!(BucketSide::classify(20.0, 20.0), BucketSide::Low);
        assert_eq!(BucketSide::classify(10.0, 20.0), BucketSide::Low);
        assert_eq!(BucketSide::classify(20.5, 20.0), BucketSide::High);
    }

    #[test]
    fn test_category_key_rendering() {
        assert_eq!(category_key(&json!(0)), Some("0".to_string()));
        assert_eq!(category_key(&json!(1.0)), Some("1".to_string()));
        assert_eq!(category_key(&json!(1.5)), Some("1.5".to_string()));
        assert_eq!(category_key(&json!("empty")), Some("empty".to_string()));
        assert_eq!(category_key(&Value::Null), None);
    }

    #[test]
    fn test_embedded_stats_threshold() {
        let stats = EmbeddedStats {
            average: Some(10.0),
            standard_deviation: Some(11.5),
            non_missing_count: 3,
        };
        assert!(stats.exceeds(1.1));

        let equal = EmbeddedStats {
            standard_deviation: Some(11.0),
            ..stats.clone()
        };
        assert!(!equal.exceeds(1.1 + 1e-9));

        let undefined = EmbeddedStats {
            standard_deviation: None,
            ..stats
        };
        assert!(!undefined.exceeds(1.1));
        assert!(!undefined.exceeds_null_as_zero(1.1));

        let lone_sentinel = EmbeddedStats {
            average: Some(-1.0),
            standard_deviation: None,
            non_missing_count: 1,
        };
        assert!(!lone_sentinel.exceeds(1.1));
        assert!(lone_sentinel.exceeds_null_as_zero(1.1));
    }

    #[test]
    fn test_embedded_stats_serializes_with_camel_case_names() {
        let stats = EmbeddedStats {
            average: Some(20.0),
            standard_deviation: Some(10.0),
            non_missing_count: 3,
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(
            value,
            json!({"average": 20.0, "standardDeviation": 10.0, "nonMissingCount": 3})
        );
    }

    #[test]
    fn test_statistic_document_is_keyed_by_variable() {
        let stat = VariableStatistic {
            variable: "age".to_string(),
            ordinal: 2,
            mean: Some(20.0),
            stddev: Some(10.0),
            count: 3,
        };
        let doc = stat.to_document().unwrap();
        assert_eq!(doc.get("_id"), Some(&json!("age")));
        assert_eq!(VariableStatistic::from_document(&doc).unwrap(), stat);
    }

    #[test]
    fn test_index_spec_name() {
        let spec = IndexSpec::new(vec![
            IndexKey {
                field: "age".to_string(),
                order: SortOrder::Descending,
            },
            IndexKey {
                field: "sex".to_string(),
                order: SortOrder::Ascending,
            },
        ]);
        assert_eq!(spec.name, "age_-1_sex_1");
    }
}
