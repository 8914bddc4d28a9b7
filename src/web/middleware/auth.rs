use salvo::prelude::*;
use serde_json::json;

use crate::web::web_state;

/// Homeserver-token check for everything the homeserver pushes at us. The
/// appservice API sends the token either as an `access_token` query
/// parameter or as a bearer header.
#[handler]
pub async fn authorize(req: &mut Request, res: &mut Response, ctrl: &mut FlowCtrl) {
    let presented = req
        .query::<String>("access_token")
        .or_else(|| {
            req.header::<String>("authorization")
                .and_then(|h| h.strip_prefix("Bearer ").map(str::to_string))
        })
        .unwrap_or_default();

    let expected = &web_state().bridge.config().registration.homeserver_token;
    if presented.is_empty() || &presented != expected {
        res.status_code(StatusCode::FORBIDDEN);
        res.render(Json(json!({
            "errcode": "M_FORBIDDEN",
            "error": "Bad token supplied",
        })));
        ctrl.skip_rest();
    }
}
