use salvo::prelude::*;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::bridge::MatrixEvent;
use crate::web::web_state;

fn render_error(res: &mut Response, status: StatusCode, errcode: &str, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "errcode": errcode, "error": message })));
}

/// `PUT /transactions/{txn_id}` - the homeserver's event push. Events are
/// handed off to the bridge in the background and the transaction is acked
/// immediately; the homeserver retries whole transactions on anything but a
/// 200, so per-event failures must not fail the batch.
#[handler]
pub async fn push_transaction(req: &mut Request, res: &mut Response) {
    let txn_id = req.param::<String>("txn_id").unwrap_or_default();

    let body = match req.parse_json::<Value>().await {
        Ok(body) => body,
        Err(e) => {
            debug!("rejecting malformed transaction {}: {}", txn_id, e);
            render_error(
                res,
                StatusCode::BAD_REQUEST,
                "M_NOT_JSON",
                "transaction body is not valid JSON",
            );
            return;
        }
    };
    let Some(events) = body.get("events").and_then(Value::as_array) else {
        render_error(
            res,
            StatusCode::BAD_REQUEST,
            "M_BAD_JSON",
            "transaction has no events array",
        );
        return;
    };

    debug!("transaction {} with {} events", txn_id, events.len());
    for raw in events {
        let event: MatrixEvent = match serde_json::from_value(raw.clone()) {
            Ok(event) => event,
            Err(e) => {
                warn!("skipping undecodable event in transaction {}: {}", txn_id, e);
                continue;
            }
        };
        let bridge = web_state().bridge.clone();
        tokio::spawn(async move {
            bridge.handle_event(event).await;
        });
    }

    res.render(Json(json!({})));
}

/// `GET /users/{user_id}` - the homeserver asking whether a user in our
/// namespace exists. Anything carrying the account prefix is ours.
#[handler]
pub async fn query_user(req: &mut Request, res: &mut Response) {
    let user_id = req.param::<String>("user_id").unwrap_or_default();
    let bridge = &web_state().bridge;

    if user_id.contains(&bridge.config().bridge.account_prefix) {
        res.render(Json(json!({})));
        return;
    }
    match bridge.db().user_store().get_by_matrix_id(&user_id).await {
        Ok(Some(_)) => res.render(Json(json!({}))),
        Ok(None) => render_error(res, StatusCode::NOT_FOUND, "M_NOT_FOUND", "unknown user"),
        Err(e) => render_error(
            res,
            StatusCode::INTERNAL_SERVER_ERROR,
            "M_UNKNOWN",
            &format!("database error: {}", e),
        ),
    }
}

/// `GET /rooms/{room_alias}` - room-alias existence query, answered from the
/// channel table by the alias localpart.
#[handler]
pub async fn query_room(req: &mut Request, res: &mut Response) {
    let alias = req.param::<String>("room_alias").unwrap_or_default();
    let localpart = alias
        .trim_start_matches('#')
        .split(':')
        .next()
        .unwrap_or_default();

    let bridge = &web_state().bridge;
    match bridge.db().channel_store().get_by_remote_name(localpart).await {
        Ok(Some(_)) => res.render(Json(json!({}))),
        Ok(None) => render_error(res, StatusCode::NOT_FOUND, "M_NOT_FOUND", "unknown room"),
        Err(e) => render_error(
            res,
            StatusCode::INTERNAL_SERVER_ERROR,
            "M_UNKNOWN",
            &format!("database error: {}", e),
        ),
    }
}
