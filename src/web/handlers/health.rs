use salvo::prelude::*;
use serde_json::json;

use crate::web::web_state;

#[handler]
pub async fn health_check(res: &mut Response) {
    res.render(Json(json!({ "status": "ok" })));
}

#[handler]
pub async fn get_status(res: &mut Response) {
    let state = web_state();
    let channels = match state.bridge.db().channel_store().list().await {
        Ok(channels) => channels.len(),
        Err(_) => 0,
    };
    res.render(Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "protocol": state.bridge.protocol_label(),
        "channels": channels,
    })));
}
