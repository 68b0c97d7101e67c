use crate::backup;
use crate::db;
use crate::ipc::error::{err, no_workspace, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

fn handle_backup_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let Some((workspace_path, conn)) = state.open_workspace() else {
        return no_workspace(&req.id);
    };

    // Fold the WAL back into the main file before copying it.
    if let Err(e) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
        warn!(error = %e, "wal checkpoint before export failed");
    }

    let out = PathBuf::from(&out_path);
    let exported_at = Utc::now().to_rfc3339();
    let export = match backup::export_workspace_bundle(workspace_path, &out, &exported_at) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };
    info!(path = %out_path, sha256 = %export.db_sha256, "workspace exported");

    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "dbSha256": export.db_sha256,
            "dbBytes": export.db_bytes
        }),
    )
}

fn handle_backup_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return no_workspace(&req.id);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }

    // The database file is replaced underneath the connection.
    state.db = None;
    let imported = backup::import_workspace_bundle(&src, &workspace_path);
    let reopened = db::open_db(&workspace_path);
    let conn = match reopened {
        Ok(conn) => conn,
        Err(e) => {
            state.workspace = None;
            return err(&req.id, "db_open_failed", format!("{e:?}"), None);
        }
    };
    state.db = Some(conn);

    match imported {
        Ok(import) => {
            info!(path = %in_path, "workspace imported");
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormatDetected": import.bundle_format_detected,
                    "dbSha256": import.db_sha256
                }),
            )
        }
        Err(e) => err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": src.to_string_lossy() })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_backup_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_backup_import_workspace_bundle(state, req)),
        _ => None,
    }
}
