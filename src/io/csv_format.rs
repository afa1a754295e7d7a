//! CSV format handling for operation requests and balance output
//!
//! Input columns: `type,from,to,amount,reference,description`.
//! Output columns: `user,amount,version`.
//!
//! All functions are pure (no I/O) for easy testing.

use std::io::Write;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::types::{Balance, TransactionRequest, TransactionType, UserId};

/// One input row as it appears in the file
///
/// Party columns are empty when they do not apply (no `from` for a credit).
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CsvRecord {
    #[serde(rename = "type")]
    pub tx_type: String,
    pub from: Option<UserId>,
    pub to: Option<UserId>,
    pub amount: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A parsed operation ready for the transaction service
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRecord {
    pub tx_type: TransactionType,
    pub request: TransactionRequest,
}

/// Convert a CsvRecord into an OperationRecord
///
/// Only the shape of the row is checked here. Amount sign, party rules and
/// balances are the service's job, so a row with a negative amount converts
/// fine and is rejected later with a proper error.
///
/// # Returns
///
/// * `Ok(OperationRecord)` - Successfully converted record
/// * `Err(String)` - Unknown type, missing or unparsable amount
pub fn convert_csv_record(csv_record: CsvRecord) -> Result<OperationRecord, String> {
    let tx_type = match csv_record.tx_type.to_lowercase().as_str() {
        "credit" => TransactionType::Credit,
        "debit" => TransactionType::Debit,
        "transfer" => TransactionType::Transfer,
        _ => {
            return Err(format!(
                "Invalid transaction type: '{}'",
                csv_record.tx_type
            ))
        }
    };

    let amount = match csv_record.amount {
        Some(amount_str) if !amount_str.trim().is_empty() => Decimal::from_str(amount_str.trim())
            .map_err(|_| format!("Invalid amount '{}' for {} operation", amount_str, tx_type))?,
        _ => return Err(format!("{} operation requires an amount", tx_type)),
    };

    let reference_id = csv_record
        .reference
        .map(|reference| reference.trim().to_string())
        .filter(|reference| !reference.is_empty());

    Ok(OperationRecord {
        tx_type,
        request: TransactionRequest {
            from_user: csv_record.from,
            to_user: csv_record.to,
            amount,
            description: csv_record.description.unwrap_or_default(),
            reference_id,
        },
    })
}

/// Write balances to CSV format
///
/// Balances are sorted by user ID for deterministic output and amounts are
/// printed with four decimal places.
///
/// # Returns
///
/// * `Ok(())` if writing succeeded
/// * `Err(String)` if a write error occurred
pub fn write_balances_csv(balances: &[Balance], output: &mut dyn Write) -> Result<(), String> {
    use csv::Writer;

    let mut writer = Writer::from_writer(output);

    writer
        .write_record(["user", "amount", "version"])
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    let mut sorted = balances.to_vec();
    sorted.sort_by_key(|balance| balance.user_id);

    for balance in sorted {
        writer
            .write_record(&[
                balance.user_id.to_string(),
                format!("{:.4}", balance.amount),
                balance.version.to_string(),
            ])
            .map_err(|e| format!("Failed to write balance record: {}", e))?;
    }

    writer
        .flush()
        .map_err(|e| format!("Failed to flush output: {}", e))?;

    Ok(())
}
