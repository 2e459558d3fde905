//! Deposit processing state machine types.

use crate::coin::CoinType;
use crate::scanner::Deposit;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Processing status of a deposit.
///
/// Persisted rows move `WaitDecide -> WaitPartial -> WaitSend ->
/// WaitConfirm -> Done`, with `WaitPartial` skipped when a single deposit
/// covers the full price. `WaitDeposit` is never persisted; it is the
/// synthetic answer for a bound box with no on-chain activity yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "waiting_deposit")]
    WaitDeposit,
    #[serde(rename = "waiting_decide")]
    WaitDecide,
    #[serde(rename = "waiting_partial")]
    WaitPartial,
    #[serde(rename = "waiting_send")]
    WaitSend,
    #[serde(rename = "waiting_confirm")]
    WaitConfirm,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "unknown")]
    Unknown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::WaitDeposit => "waiting_deposit",
            Status::WaitDecide => "waiting_decide",
            Status::WaitPartial => "waiting_partial",
            Status::WaitSend => "waiting_send",
            Status::WaitConfirm => "waiting_confirm",
            Status::Done => "done",
            Status::Unknown => "unknown",
        }
    }

    /// Parse a status string, falling back to [`Status::Unknown`].
    pub fn from_str_lossy(s: &str) -> Status {
        match s {
            "waiting_deposit" => Status::WaitDeposit,
            "waiting_decide" => Status::WaitDecide,
            "waiting_partial" => Status::WaitPartial,
            "waiting_send" => Status::WaitSend,
            "waiting_confirm" => Status::WaitConfirm,
            "done" => Status::Done,
            _ => Status::Unknown,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An address binding: which box a deposit address pays for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundAddress {
    pub kitty_id: String,
    pub address: String,
    pub coin_type: CoinType,
}

/// Accumulated payment progress for one deposit address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositTrack {
    pub kitty_id: String,
    /// Total deposited so far, smallest units. Never decreases.
    pub amount_deposited: i64,
    /// Box price in the bound coin, smallest units.
    pub amount_required: i64,
}

/// Persisted per-deposit state machine row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositInfo {
    /// Dense monotonic insertion sequence; starts at 1.
    pub seq: u64,
    /// Unix seconds of the last mutation.
    pub updated_at: i64,
    pub status: Status,
    pub coin_type: CoinType,
    pub kitty_id: String,
    pub deposit_address: String,
    /// Buyer address the box is delivered to.
    pub owner_address: String,
    /// `"{txid}:{n}"` of the on-chain deposit.
    pub deposit_id: String,
    /// Hash of the outbound ledger transaction, once created.
    #[serde(default)]
    pub txid: String,
    /// Deposit amount in smallest units.
    pub deposit_value: i64,
    /// An error that occurred during processing.
    #[serde(default)]
    pub error: String,
    /// The original deposit, kept for the records. All data needed for
    /// processing is copied to the top level.
    pub deposit: Deposit,
}

/// Overall statistics folded over the deposit table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositStats {
    pub total_btc_received: i64,
    pub total_sky_received: i64,
    pub total_boxes_sent: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidateError {
    #[error("seq missing")]
    SeqMissing,
    #[error("kitty id missing")]
    KittyIdMissing,
    #[error("deposit address missing")]
    DepositAddressMissing,
    #[error("deposit id missing")]
    DepositIdMissing,
    #[error("invalid deposit id value {0:?}")]
    InvalidDepositId(String),
    #[error("deposit value is zero")]
    DepositValueZero,
    #[error("txid missing")]
    TxidMissing,
    #[error("deposit info should not have status {0}")]
    InvalidStatus(String),
}

impl DepositInfo {
    /// Consistency check of the row against its status.
    pub fn validate_for_status(&self) -> Result<(), ValidateError> {
        let check_wait_send = || {
            if self.seq == 0 {
                return Err(ValidateError::SeqMissing);
            }
            if self.kitty_id.is_empty() {
                return Err(ValidateError::KittyIdMissing);
            }
            if self.deposit_address.is_empty() {
                return Err(ValidateError::DepositAddressMissing);
            }
            if self.deposit_id.is_empty() {
                return Err(ValidateError::DepositIdMissing);
            }
            if self.coin_type == CoinType::Btc && !is_valid_btc_deposit_id(&self.deposit_id) {
                return Err(ValidateError::InvalidDepositId(self.deposit_id.clone()));
            }
            if self.deposit_value == 0 {
                return Err(ValidateError::DepositValueZero);
            }
            Ok(())
        };

        match self.status {
            Status::Done => {
                // A Done row without a txid is possible only when the send
                // was skipped because of an error recorded on the row.
                if self.txid.is_empty() && self.error.is_empty() {
                    return Err(ValidateError::TxidMissing);
                }
                check_wait_send()
            }
            Status::WaitConfirm => {
                if self.txid.is_empty() {
                    return Err(ValidateError::TxidMissing);
                }
                check_wait_send()
            }
            Status::WaitSend | Status::WaitDecide | Status::WaitPartial => check_wait_send(),
            Status::WaitDeposit | Status::Unknown => {
                Err(ValidateError::InvalidStatus(self.status.to_string()))
            }
        }
    }
}

/// BTC deposit ids must look like `"{txid}:{n}"` with numeric `n`.
fn is_valid_btc_deposit_id(deposit_id: &str) -> bool {
    match deposit_id.split_once(':') {
        Some((tx, n)) => !tx.is_empty() && !n.is_empty() && n.parse::<i64>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_info(status: Status) -> DepositInfo {
        DepositInfo {
            seq: 1,
            updated_at: 0,
            status,
            coin_type: CoinType::Btc,
            kitty_id: "42".to_string(),
            deposit_address: "A1".to_string(),
            owner_address: "B1".to_string(),
            deposit_id: "t:0".to_string(),
            txid: String::new(),
            deposit_value: 100_000,
            error: String::new(),
            deposit: Deposit {
                coin: CoinType::Btc,
                address: "A1".to_string(),
                value: 100_000,
                height: 500,
                tx: "t".to_string(),
                n: 0,
                processed: false,
            },
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            Status::WaitDeposit,
            Status::WaitDecide,
            Status::WaitPartial,
            Status::WaitSend,
            Status::WaitConfirm,
            Status::Done,
            Status::Unknown,
        ] {
            assert_eq!(Status::from_str_lossy(status.as_str()), status);
        }
        assert_eq!(Status::from_str_lossy("bogus"), Status::Unknown);
    }

    #[test]
    fn test_validate_wait_send() {
        base_info(Status::WaitSend).validate_for_status().unwrap();

        let mut info = base_info(Status::WaitSend);
        info.seq = 0;
        assert_eq!(info.validate_for_status(), Err(ValidateError::SeqMissing));

        let mut info = base_info(Status::WaitSend);
        info.deposit_id = "no-vout-index".to_string();
        assert!(matches!(
            info.validate_for_status(),
            Err(ValidateError::InvalidDepositId(_))
        ));

        let mut info = base_info(Status::WaitSend);
        info.deposit_value = 0;
        assert_eq!(
            info.validate_for_status(),
            Err(ValidateError::DepositValueZero)
        );
    }

    #[test]
    fn test_validate_wait_confirm_requires_txid() {
        let mut info = base_info(Status::WaitConfirm);
        assert_eq!(info.validate_for_status(), Err(ValidateError::TxidMissing));
        info.txid = "deadbeef".to_string();
        info.validate_for_status().unwrap();
    }

    #[test]
    fn test_validate_done_allows_recorded_error() {
        let mut info = base_info(Status::Done);
        assert_eq!(info.validate_for_status(), Err(ValidateError::TxidMissing));
        info.error = "sending no kitty".to_string();
        info.validate_for_status().unwrap();
    }

    #[test]
    fn test_validate_rejects_unprocessable_statuses() {
        for status in [Status::WaitDeposit, Status::Unknown] {
            assert!(matches!(
                base_info(status).validate_for_status(),
                Err(ValidateError::InvalidStatus(_))
            ));
        }
    }

    #[test]
    fn test_btc_deposit_id_shapes() {
        assert!(is_valid_btc_deposit_id("abc:0"));
        assert!(!is_valid_btc_deposit_id("abc"));
        assert!(!is_valid_btc_deposit_id(":0"));
        assert!(!is_valid_btc_deposit_id("abc:"));
        assert!(!is_valid_btc_deposit_id("abc:x"));
    }
}
