use crate::db;
use crate::ipc::error::{err, no_workspace, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_batches_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let limit = match req.params.get("limit") {
        None | Some(serde_json::Value::Null) => 20,
        Some(v) => match v.as_i64() {
            Some(n) if (1..=500).contains(&n) => n,
            _ => return err(&req.id, "bad_params", "limit must be in 1..=500", None),
        },
    };
    match db::list_batches(conn, limit) {
        Ok(batches) => ok(&req.id, json!({ "batches": batches })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_batches_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let Some(batch_id) = req.params.get("batchId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing batchId", None);
    };
    match db::get_batch(conn, batch_id) {
        Ok(Some(batch)) => ok(&req.id, batch),
        Ok(None) => err(
            &req.id,
            "not_found",
            "batch not found",
            Some(json!({ "batchId": batch_id })),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "batches.list" => Some(handle_batches_list(state, req)),
        "batches.get" => Some(handle_batches_get(state, req)),
        _ => None,
    }
}
