//! Dummy-mode admin handlers.
//!
//! These drive the in-memory scanner and sender fakes when `[dummy]` is
//! enabled in the config. The routes are always mounted; without the
//! corresponding fake they answer 404.

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use teller_core::coin::CoinType;
use teller_core::scanner::Deposit;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorBody { error: message })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct DummyDepositRequest {
    pub coin_type: String,
    pub address: String,
    pub value: i64,
    pub height: i64,
    pub tx: String,
    pub n: u32,
}

/// Publish a deposit on the dummy scanner, as if it had been found
/// on-chain.
pub async fn dummy_inject_deposit(
    State(state): State<AppState>,
    Json(req): Json<DummyDepositRequest>,
) -> Response {
    let coin: CoinType = match req.coin_type.parse() {
        Ok(coin) => coin,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let Some(scanner) = state.dummy.scanners.get(&coin) else {
        return error_response(
            StatusCode::NOT_FOUND,
            "dummy scanner is not enabled".to_string(),
        );
    };

    let deposit = Deposit {
        coin,
        address: req.address,
        value: req.value,
        height: req.height,
        tx: req.tx,
        n: req.n,
        processed: false,
    };
    match scanner.inject_deposit(deposit).await {
        Ok(_ack) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct DummyConfirmRequest {
    pub txid: String,
}

/// Mark a broadcast transaction as confirmed on the dummy ledger.
pub async fn dummy_confirm_tx(
    State(state): State<AppState>,
    Json(req): Json<DummyConfirmRequest>,
) -> Response {
    let Some(sender) = &state.dummy.sender else {
        return error_response(
            StatusCode::NOT_FOUND,
            "dummy sender is not enabled".to_string(),
        );
    };
    sender.set_tx_confirmed(&req.txid);
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::dummy_state;
    use crate::state::DummyHandles;
    use teller_core::sender::BoxSender;

    fn deposit_request(coin_type: &str) -> DummyDepositRequest {
        DummyDepositRequest {
            coin_type: coin_type.to_string(),
            address: "14JwrdSxYXPxSi6crLKVwR4k2dbjfVZ3xj".to_string(),
            value: 100_000,
            height: 500,
            tx: "t".to_string(),
            n: 0,
        }
    }

    #[tokio::test]
    async fn test_injected_deposit_reaches_scanner_stream() {
        let mut ts = dummy_state().await;

        let response =
            dummy_inject_deposit(State(ts.state.clone()), Json(deposit_request("BTC"))).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let note = ts.deposits.recv().await.unwrap();
        assert_eq!(note.deposit.deposit_id(), "t:0");
        assert_eq!(note.deposit.coin, CoinType::Btc);
        assert_eq!(note.deposit.value, 100_000);
        let _ = note.ack.send(Ok(()));
    }

    #[tokio::test]
    async fn test_inject_rejects_unknown_coin() {
        let ts = dummy_state().await;

        let response =
            dummy_inject_deposit(State(ts.state.clone()), Json(deposit_request("ETH"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // SKY is a valid coin but has no dummy scanner registered here.
        let response = dummy_inject_deposit(State(ts.state), Json(deposit_request("SKY"))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_confirm_marks_transaction_on_dummy_ledger() {
        let ts = dummy_state().await;

        let response = dummy_confirm_tx(
            State(ts.state.clone()),
            Json(DummyConfirmRequest {
                txid: "deadbeef".to_string(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let confirmed = ts
            .sender
            .is_tx_confirmed("deadbeef")
            .await
            .unwrap()
            .unwrap();
        assert!(confirmed.confirmed);
    }

    #[tokio::test]
    async fn test_endpoints_answer_not_found_outside_dummy_mode() {
        let ts = dummy_state().await;
        let mut state = ts.state.clone();
        state.dummy = DummyHandles::default();

        let response =
            dummy_inject_deposit(State(state.clone()), Json(deposit_request("BTC"))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = dummy_confirm_tx(
            State(state),
            Json(DummyConfirmRequest {
                txid: "deadbeef".to_string(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
