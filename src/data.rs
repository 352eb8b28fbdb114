//! Transaction ingestion and RFM feature computation using Polars

use crate::error::SegmentationError;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use log::{debug, info, warn};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Columns every transaction table must carry
pub const REQUIRED_COLUMNS: [&str; 3] = ["customer_id", "transaction_date", "net_amount"];

/// A single ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub customer_id: String,
    pub transaction_date: NaiveDateTime,
    pub net_amount: f64,
}

impl Transaction {
    pub fn new(customer_id: impl Into<String>, transaction_date: NaiveDateTime, net_amount: f64) -> Self {
        Self {
            customer_id: customer_id.into(),
            transaction_date,
            net_amount,
        }
    }
}

/// Per-customer RFM metrics and derived statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfmRow {
    pub customer_id: String,
    /// Days between the latest transaction in the dataset and this customer's latest
    pub recency_days: i64,
    pub frequency_transactions: usize,
    pub monetary_total: f64,
    pub monetary_avg: f64,
    /// Sample standard deviation of net_amount; 0 for single-purchase customers
    pub monetary_std: f64,
    pub days_since_first_purchase: i64,
    pub avg_days_between_purchases: f64,
    pub clv_proxy: f64,
}

impl RfmRow {
    /// Numeric value of a feature column
    pub fn value(&self, feature: RfmFeature) -> f64 {
        match feature {
            RfmFeature::RecencyDays => self.recency_days as f64,
            RfmFeature::FrequencyTransactions => self.frequency_transactions as f64,
            RfmFeature::MonetaryTotal => self.monetary_total,
            RfmFeature::MonetaryAvg => self.monetary_avg,
            RfmFeature::MonetaryStd => self.monetary_std,
            RfmFeature::DaysSinceFirstPurchase => self.days_since_first_purchase as f64,
            RfmFeature::AvgDaysBetweenPurchases => self.avg_days_between_purchases,
            RfmFeature::ClvProxy => self.clv_proxy,
        }
    }
}

/// Numeric columns of an [`RfmRow`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RfmFeature {
    RecencyDays,
    FrequencyTransactions,
    MonetaryTotal,
    MonetaryAvg,
    MonetaryStd,
    DaysSinceFirstPurchase,
    AvgDaysBetweenPurchases,
    ClvProxy,
}

impl RfmFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecencyDays => "recency_days",
            Self::FrequencyTransactions => "frequency_transactions",
            Self::MonetaryTotal => "monetary_total",
            Self::MonetaryAvg => "monetary_avg",
            Self::MonetaryStd => "monetary_std",
            Self::DaysSinceFirstPurchase => "days_since_first_purchase",
            Self::AvgDaysBetweenPurchases => "avg_days_between_purchases",
            Self::ClvProxy => "clv_proxy",
        }
    }
}

impl fmt::Display for RfmFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RfmFeature {
    type Err = SegmentationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recency_days" => Ok(Self::RecencyDays),
            "frequency_transactions" => Ok(Self::FrequencyTransactions),
            "monetary_total" => Ok(Self::MonetaryTotal),
            "monetary_avg" => Ok(Self::MonetaryAvg),
            "monetary_std" => Ok(Self::MonetaryStd),
            "days_since_first_purchase" => Ok(Self::DaysSinceFirstPurchase),
            "avg_days_between_purchases" => Ok(Self::AvgDaysBetweenPurchases),
            "clv_proxy" => Ok(Self::ClvProxy),
            other => Err(SegmentationError::UnknownFeature(other.to_string())),
        }
    }
}

/// One row per customer, ordered by customer_id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RfmTable {
    rows: Vec<RfmRow>,
}

impl RfmTable {
    /// Build a table from precomputed rows, rejecting duplicate customers
    pub fn from_rows(rows: Vec<RfmRow>) -> crate::Result<Self> {
        let mut seen = HashSet::with_capacity(rows.len());
        for (row, rfm) in rows.iter().enumerate() {
            if !seen.insert(rfm.customer_id.as_str()) {
                return Err(SegmentationError::MalformedValue {
                    column: "customer_id".to_string(),
                    row,
                    reason: format!("duplicate customer '{}'", rfm.customer_id),
                });
            }
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[RfmRow] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RfmRow> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn customer_ids(&self) -> Vec<&str> {
        self.rows.iter().map(|row| row.customer_id.as_str()).collect()
    }

    /// Extract one feature column
    pub fn values(&self, feature: RfmFeature) -> Vec<f64> {
        self.rows.iter().map(|row| row.value(feature)).collect()
    }

    pub fn get(&self, customer_id: &str) -> Option<&RfmRow> {
        self.rows.iter().find(|row| row.customer_id == customer_id)
    }
}

impl<'a> IntoIterator for &'a RfmTable {
    type Item = &'a RfmRow;
    type IntoIter = std::slice::Iter<'a, RfmRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Load a transaction CSV (with header) into a DataFrame
///
/// Date-like columns are parsed while reading, so `transaction_date`
/// usually arrives as a `Date` or `Datetime` column.
pub fn load_transactions(file_path: impl AsRef<Path>) -> crate::Result<DataFrame> {
    let df = LazyCsvReader::new(file_path.as_ref())
        .with_has_header(true)
        .with_try_parse_dates(true)
        .finish()?
        .collect()?;

    info!(
        "Loaded {} transactions from {}",
        df.height(),
        file_path.as_ref().display()
    );
    Ok(df)
}

/// Extract typed transactions from a DataFrame
///
/// # Errors
/// * `MissingColumn` when one of [`REQUIRED_COLUMNS`] is absent
/// * `EmptyInput` when the frame has no rows
/// * `MalformedValue` for null cells or unparseable dates
pub fn transactions_from_frame(df: &DataFrame) -> crate::Result<Vec<Transaction>> {
    let columns = df.get_column_names();
    for required in REQUIRED_COLUMNS {
        if !columns.contains(&required) {
            return Err(SegmentationError::MissingColumn {
                column: required.to_string(),
            });
        }
    }

    if df.height() == 0 {
        return Err(SegmentationError::EmptyInput);
    }

    let ids = df.column("customer_id")?.cast(&DataType::String)?;
    let ids = ids.str()?;
    let amounts = df.column("net_amount")?.cast(&DataType::Float64)?;
    let amounts = amounts.f64()?;
    let dates = parse_date_column(df.column("transaction_date")?)?;

    let mut transactions = Vec::with_capacity(df.height());
    for (row, ((id, date), amount)) in ids
        .into_iter()
        .zip(dates)
        .zip(amounts.into_iter())
        .enumerate()
    {
        let customer_id = id.ok_or_else(|| null_cell("customer_id", row))?;
        let transaction_date = date.ok_or_else(|| null_cell("transaction_date", row))?;
        let net_amount = amount.ok_or_else(|| null_cell("net_amount", row))?;
        check_amount(net_amount, row)?;
        transactions.push(Transaction::new(customer_id, transaction_date, net_amount));
    }

    Ok(transactions)
}

/// Compute RFM features from a transaction DataFrame
pub fn calculate_rfm_features(df: &DataFrame) -> crate::Result<RfmTable> {
    let transactions = transactions_from_frame(df)?;
    calculate_rfm_from_transactions(&transactions)
}

/// Compute RFM features from typed transactions
///
/// The reference date is the latest transaction date across all rows, so
/// the most recent customer always has `recency_days == 0`.
pub fn calculate_rfm_from_transactions(transactions: &[Transaction]) -> crate::Result<RfmTable> {
    let reference_date = transactions
        .iter()
        .map(|tx| tx.transaction_date)
        .max()
        .ok_or(SegmentationError::EmptyInput)?;

    for (row, tx) in transactions.iter().enumerate() {
        check_amount(tx.net_amount, row)?;
    }

    let non_positive = transactions.iter().filter(|tx| tx.net_amount <= 0.0).count();
    if non_positive > 0 {
        warn!(
            "{} transactions have non-positive net_amount; they are aggregated as given",
            non_positive
        );
    }

    let ledger = df!(
        "customer_id" => transactions.iter().map(|tx| tx.customer_id.as_str()).collect::<Vec<_>>(),
        TIMESTAMP_COLUMN => transactions
            .iter()
            .map(|tx| tx.transaction_date.and_utc().timestamp_millis())
            .collect::<Vec<_>>(),
        "net_amount" => transactions.iter().map(|tx| tx.net_amount).collect::<Vec<_>>()
    )?;

    let reference_ms = reference_date.and_utc().timestamp_millis();
    let rfm_df = compute_rfm_frame(ledger, reference_ms)?;
    let rows = rfm_rows(&rfm_df)?;

    debug!(
        "Computed RFM features for {} customers (reference date {})",
        rows.len(),
        reference_date
    );

    Ok(RfmTable { rows })
}

const TIMESTAMP_COLUMN: &str = "transaction_ms";
const MS_PER_DAY: f64 = 86_400_000.0;

/// Whole days between two millisecond timestamp expressions
fn days_between(later: Expr, earlier: Expr) -> Expr {
    ((later - earlier).cast(DataType::Float64) / lit(MS_PER_DAY)).cast(DataType::Int64)
}

/// Group the ledger by customer and derive every RFM column, sorted by customer_id
fn compute_rfm_frame(ledger: DataFrame, reference_ms: i64) -> crate::Result<DataFrame> {
    let frequency = || col("frequency_transactions").cast(DataType::Float64);

    let rfm_df = ledger
        .lazy()
        .group_by([col("customer_id")])
        .agg([
            col(TIMESTAMP_COLUMN).min().alias("first_purchase"),
            col(TIMESTAMP_COLUMN).max().alias("last_purchase"),
            col("net_amount").count().alias("frequency_transactions"),
            col("net_amount").sum().alias("monetary_total"),
            col("net_amount").mean().alias("monetary_avg"),
            col("net_amount").std(1).alias("monetary_std"),
        ])
        .with_columns([
            days_between(lit(reference_ms), col("last_purchase")).alias("recency_days"),
            days_between(lit(reference_ms), col("first_purchase"))
                .alias("days_since_first_purchase"),
            days_between(col("last_purchase"), col("first_purchase")).alias("span_days"),
            // Sample std is undefined for a single purchase
            when(col("frequency_transactions").gt(lit(1)))
                .then(col("monetary_std"))
                .otherwise(lit(0.0))
                .alias("monetary_std"),
        ])
        .with_columns([
            (col("span_days").cast(DataType::Float64)
                / when(col("frequency_transactions").gt(lit(1)))
                    .then(frequency() - lit(1.0))
                    .otherwise(lit(1.0)))
            .alias("avg_days_between_purchases"),
            (col("monetary_total") * frequency()
                / (col("days_since_first_purchase").cast(DataType::Float64) + lit(1.0)))
            .alias("clv_proxy"),
        ])
        .sort(["customer_id"], SortMultipleOptions::default())
        .collect()?;

    Ok(rfm_df)
}

/// Read the aggregated frame back into typed rows
fn rfm_rows(rfm_df: &DataFrame) -> crate::Result<Vec<RfmRow>> {
    let ids = rfm_df.column("customer_id")?.str()?;
    let recency = int_column(rfm_df, "recency_days")?;
    let frequency = int_column(rfm_df, "frequency_transactions")?;
    let monetary_total = float_column(rfm_df, "monetary_total")?;
    let monetary_avg = float_column(rfm_df, "monetary_avg")?;
    let monetary_std = float_column(rfm_df, "monetary_std")?;
    let days_since_first = int_column(rfm_df, "days_since_first_purchase")?;
    let avg_days_between = float_column(rfm_df, "avg_days_between_purchases")?;
    let clv_proxy = float_column(rfm_df, "clv_proxy")?;

    ids.into_iter()
        .enumerate()
        .map(|(row, id)| {
            Ok(RfmRow {
                customer_id: id.ok_or_else(|| null_cell("customer_id", row))?.to_string(),
                recency_days: recency[row],
                frequency_transactions: frequency[row] as usize,
                monetary_total: monetary_total[row],
                monetary_avg: monetary_avg[row],
                monetary_std: monetary_std[row],
                days_since_first_purchase: days_since_first[row],
                avg_days_between_purchases: avg_days_between[row],
                clv_proxy: clv_proxy[row],
            })
        })
        .collect()
}

fn int_column(df: &DataFrame, name: &str) -> crate::Result<Vec<i64>> {
    let values = df.column(name)?.cast(&DataType::Int64)?;
    values
        .i64()?
        .into_iter()
        .enumerate()
        .map(|(row, value)| value.ok_or_else(|| null_cell(name, row)))
        .collect()
}

fn float_column(df: &DataFrame, name: &str) -> crate::Result<Vec<f64>> {
    let values = df.column(name)?.cast(&DataType::Float64)?;
    values
        .f64()?
        .into_iter()
        .enumerate()
        .map(|(row, value)| value.ok_or_else(|| null_cell(name, row)))
        .collect()
}

fn check_amount(amount: f64, row: usize) -> crate::Result<()> {
    if !amount.is_finite() {
        return Err(SegmentationError::MalformedValue {
            column: "net_amount".to_string(),
            row,
            reason: format!("non-finite amount {}", amount),
        });
    }
    Ok(())
}

fn null_cell(column: &str, row: usize) -> SegmentationError {
    SegmentationError::MalformedValue {
        column: column.to_string(),
        row,
        reason: "null value".to_string(),
    }
}

/// Convert a Date, Datetime or String column into timestamps
fn parse_date_column(column: &Series) -> crate::Result<Vec<Option<NaiveDateTime>>> {
    match column.dtype() {
        DataType::String => column
            .str()?
            .into_iter()
            .enumerate()
            .map(|(row, value)| match value {
                None => Ok(None),
                Some(raw) => parse_timestamp(raw).map(Some).ok_or_else(|| {
                    SegmentationError::MalformedValue {
                        column: "transaction_date".to_string(),
                        row,
                        reason: format!("cannot parse '{}' as a date", raw),
                    }
                }),
            })
            .collect(),
        DataType::Date => {
            let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .ok_or_else(|| SegmentationError::MalformedValue {
                    column: "transaction_date".to_string(),
                    row: 0,
                    reason: "invalid epoch".to_string(),
                })?;
            let days = column.cast(&DataType::Int32)?;
            let days = days
                .i32()?
                .into_iter()
                .map(|value| value.map(|d| epoch + Duration::days(d as i64)))
                .collect();
            Ok(days)
        }
        DataType::Datetime(unit, _) => {
            let unit = *unit;
            let raw = column.cast(&DataType::Int64)?;
            raw.i64()?
                .into_iter()
                .enumerate()
                .map(|(row, value)| match value {
                    None => Ok(None),
                    Some(v) => from_epoch(v, unit).map(Some).ok_or_else(|| {
                        SegmentationError::MalformedValue {
                            column: "transaction_date".to_string(),
                            row,
                            reason: format!("timestamp {} out of range", v),
                        }
                    }),
                })
                .collect()
        }
        other => Err(SegmentationError::MalformedValue {
            column: "transaction_date".to_string(),
            row: 0,
            reason: format!("unsupported dtype {}", other),
        }),
    }
}

fn from_epoch(value: i64, unit: TimeUnit) -> Option<NaiveDateTime> {
    let per_second: i64 = match unit {
        TimeUnit::Nanoseconds => 1_000_000_000,
        TimeUnit::Microseconds => 1_000_000,
        TimeUnit::Milliseconds => 1_000,
    };
    let secs = value.div_euclid(per_second);
    let nanos = (value.rem_euclid(per_second) * (1_000_000_000 / per_second)) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos).map(|dt| dt.naive_utc())
}

/// Parse ISO dates, naive timestamps and RFC 3339 timestamps
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
    ];
    for format in FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}
