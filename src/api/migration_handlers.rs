//! Migration HTTP surface. Tenant-owner authenticated via `X-User-Id`,
//! optionally IP-allowlisted via `migration_allowed_ips` checked against
//! `X-Forwarded-For`.
//!
//! Request handling follows rate limit, then lock, then validate, then
//! apply, with one thin handler per endpoint per the `api::rest::handlers`
//! convention.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ClusterError, Result};
use crate::migration::audit::SecurityEventType;
use crate::migration::export::ExportRequest;
use crate::migration::import::ImportRequest;
use crate::migration::package::{Compression, ConflictResolutionPolicy, MigrationRecord, MIGRATIONS_COLLECTION};
use crate::migration::schedule::ScheduledMigration;
use crate::migration::security;
use crate::migration::transfer::TransferRecord;
use crate::migration::RemoteInstance;
use crate::runtime::ClusterHandle;
use crate::util::new_id;

/// Resolves the authenticated tenant owner from `X-User-Id` and, if an IP
/// allowlist is configured, checks the caller's address against it.
fn require_owner(state: &ClusterHandle, headers: &HeaderMap) -> Result<String> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ClusterError::Unauthorized("missing X-User-Id".to_string()))?
        .to_string();

    if !state.config.migration_allowed_ips.is_empty() {
        let caller_ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .unwrap_or("");
        if !state.config.migration_allowed_ips.iter().any(|ip| ip == caller_ip) {
            return Err(ClusterError::Forbidden(format!("{caller_ip} is not an allowed migration client")));
        }
    }
    Ok(user_id)
}

fn decode_key(hex_key: &Option<String>) -> Result<Option<[u8; 32]>> {
    match hex_key {
        None => Ok(None),
        Some(s) => {
            let bytes = hex::decode(s).map_err(|e| ClusterError::Validation(format!("invalid encryption key: {e}")))?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| ClusterError::Validation("encryption key must be 32 bytes".to_string()))?;
            Ok(Some(arr))
        }
    }
}

async fn load_record(state: &ClusterHandle, migration_id: &str) -> Result<MigrationRecord> {
    let doc = state
        .store
        .get(MIGRATIONS_COLLECTION, migration_id)
        .await?
        .ok_or_else(|| ClusterError::NotFound(format!("migration {migration_id}")))?;
    Ok(serde_json::from_value(doc)?)
}

fn owns(record: &MigrationRecord, user_id: &str) -> bool {
    record.created_by == user_id
}

#[derive(Debug, Deserialize)]
pub struct ExportHttpRequest {
    pub tenant_id: Option<String>,
    /// Omitted or `null` exports every collection not in
    /// [`crate::store::INTERNAL_COLLECTIONS`].
    #[serde(default)]
    pub collections: Option<Vec<String>>,
    #[serde(default)]
    pub compression: Compression,
    pub encryption_key: Option<String>,
    pub description: Option<String>,
}

pub async fn export(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Json(req): Json<ExportHttpRequest>,
) -> Result<Json<MigrationRecord>> {
    let user_id = require_owner(&state, &headers)?;
    state.rate_limiter.check_and_increment(&user_id, "export").await?;
    let lock_scope = req.tenant_id.clone().unwrap_or_else(|| user_id.clone());
    let guard = state.migration_lock.acquire(&lock_scope, None).await?;

    let collections = match req.collections {
        Some(c) => c,
        None => state
            .store
            .list_collections()
            .await?
            .into_iter()
            .filter(|c| !crate::store::INTERNAL_COLLECTIONS.contains(&c.as_str()))
            .collect(),
    };

    let result = state
        .exporter
        .export(ExportRequest {
            tenant_id: req.tenant_id,
            collections,
            requested_by: user_id,
            compression: req.compression,
            encryption_key: decode_key(&req.encryption_key)?,
            description: req.description,
        })
        .await;

    state.migration_lock.release(guard).await?;
    Ok(Json(result?))
}

pub async fn download_export(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let user_id = require_owner(&state, &headers)?;
    let record = load_record(&state, &id).await?;
    if !owns(&record, &user_id) {
        return Err(ClusterError::Forbidden(format!("migration {id} is not owned by this user")));
    }
    let bytes = state.importer.read_package_file(&id).await?;
    state
        .audit
        .log_security_event(
            SecurityEventType::PackageDownloaded,
            Some(&user_id),
            record.tenant_id.as_deref(),
            Some(&id),
            None,
            json!({}),
        )
        .await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

#[derive(Debug, Deserialize)]
pub struct UploadHttpRequest {
    /// Hex-encoded package bytes. A real multipart upload would stream this;
    /// the JSON body keeps the handler symmetric with every other endpoint
    /// here without pulling in a multipart dependency the rest of the crate
    /// has no other use for.
    pub data_hex: String,
    /// Declared content type of the uploaded package, checked against the
    /// same allowlist a real multipart upload's `Content-Type` header would
    /// be. Defaults to `application/octet-stream`.
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub migration_package_id: String,
}

pub async fn upload(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Json(req): Json<UploadHttpRequest>,
) -> Result<Json<UploadResponse>> {
    require_owner(&state, &headers)?;
    crate::migration::export::validate_content_type(
        req.content_type.as_deref().unwrap_or("application/octet-stream"),
    )?;
    let bytes = hex::decode(&req.data_hex).map_err(|e| ClusterError::Validation(format!("invalid upload data: {e}")))?;
    if bytes.is_empty() {
        return Err(ClusterError::Validation("uploaded package is empty".to_string()));
    }
    if bytes.len() as u64 > state.config.migration_max_compressed_bytes {
        return Err(ClusterError::Validation("uploaded package exceeds the configured size limit".to_string()));
    }
    let migration_package_id = format!("upload-{}", new_id());
    let dir = std::path::Path::new(&state.config.migration_storage_dir).join("uploads");
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join(format!("{migration_package_id}.pkg")), &bytes).await?;
    Ok(Json(UploadResponse { migration_package_id }))
}

#[derive(Debug, Deserialize)]
pub struct ImportHttpRequest {
    pub migration_package_id: String,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub compression: Compression,
    pub encryption_key: Option<String>,
    pub expected_checksum: Option<String>,
    #[serde(default)]
    pub conflict_policy: ConflictResolutionPolicy,
    #[serde(default)]
    pub validate_only: bool,
}

async fn read_uploaded_package(state: &ClusterHandle, migration_package_id: &str) -> Result<Vec<u8>> {
    let path = std::path::Path::new(&state.config.migration_storage_dir)
        .join("uploads")
        .join(format!("{migration_package_id}.pkg"));
    Ok(tokio::fs::read(path).await?)
}

/// Runs decrypt/decompress/checksum/structure validation without applying
/// anything, returning the package's declared collections. Shared by
/// `/migration/import` (`validate_only=true`) and `/migration/import/validate`.
async fn validate_package(
    state: &ClusterHandle,
    package_bytes: &[u8],
    encryption_key: Option<[u8; 32]>,
    compression: Compression,
    expected_checksum: Option<&str>,
) -> Result<Value> {
    let compressed = match encryption_key {
        Some(key) => security::decrypt(package_bytes, &key)?,
        None => package_bytes.to_vec(),
    };
    let body = security::decompress(&compressed, compression, &state.config)?;
    if let Some(expected) = expected_checksum {
        security::verify_checksum(&body, expected)?;
    }
    let package: crate::migration::package::MigrationPackage = serde_json::from_slice(&body)?;
    security::validate_package_structure(&package)?;
    Ok(json!({
        "valid": true,
        "collections": package.metadata.collections.iter().map(|c| &c.name).collect::<Vec<_>>(),
        "total_documents": package.metadata.total_documents,
    }))
}

pub async fn import(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Json(req): Json<ImportHttpRequest>,
) -> Result<Json<Value>> {
    let user_id = require_owner(&state, &headers)?;
    let package_bytes = read_uploaded_package(&state, &req.migration_package_id).await?;
    let encryption_key = decode_key(&req.encryption_key)?;

    if req.validate_only {
        let report = validate_package(
            &state,
            &package_bytes,
            encryption_key,
            req.compression,
            req.expected_checksum.as_deref(),
        )
        .await?;
        return Ok(Json(report));
    }

    state.rate_limiter.check_and_increment(&user_id, "import").await?;
    let lock_scope = req.tenant_id.clone().unwrap_or_else(|| user_id.clone());
    let guard = state.migration_lock.acquire(&lock_scope, None).await?;

    let outcome = state
        .importer
        .import(ImportRequest {
            tenant_id: req.tenant_id,
            requested_by: user_id,
            package_bytes,
            expected_checksum: req.expected_checksum,
            encryption_key,
            compression: req.compression,
            conflict_policy: req.conflict_policy,
        })
        .await;

    state.migration_lock.release(guard).await?;
    let outcome = outcome?;
    Ok(Json(json!({
        "record": outcome.record,
        "imported": outcome.imported,
        "skipped": outcome.skipped,
    })))
}

pub async fn validate_import(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Json(req): Json<ImportHttpRequest>,
) -> Result<Json<Value>> {
    require_owner(&state, &headers)?;
    let package_bytes = read_uploaded_package(&state, &req.migration_package_id).await?;
    let encryption_key = decode_key(&req.encryption_key)?;
    let report = validate_package(
        &state,
        &package_bytes,
        encryption_key,
        req.compression,
        req.expected_checksum.as_deref(),
    )
    .await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct RollbackQuery {
    #[serde(default)]
    pub confirm: bool,
}

pub async fn rollback(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<RollbackQuery>,
) -> Result<Json<Value>> {
    let user_id = require_owner(&state, &headers)?;
    if !q.confirm {
        return Err(ClusterError::Validation("rollback requires confirm=true".to_string()));
    }
    let record = load_record(&state, &id).await?;
    if !owns(&record, &user_id) {
        return Err(ClusterError::Forbidden(format!("migration {id} is not owned by this user")));
    }
    state.rollback.rollback(&id, &user_id).await?;
    Ok(Json(json!({"status": "rolled_back", "migration_id": id})))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

pub async fn history(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<MigrationRecord>>> {
    let user_id = require_owner(&state, &headers)?;
    let docs = state.store.list(MIGRATIONS_COLLECTION).await?;
    let mut records: Vec<MigrationRecord> = docs
        .into_iter()
        .filter_map(|(_, v)| serde_json::from_value::<MigrationRecord>(v).ok())
        .filter(|r| r.created_by == user_id)
        .collect();
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let offset = q.offset.unwrap_or(0);
    let limit = q.limit.unwrap_or(50);
    let page = records.into_iter().skip(offset).take(limit).collect();
    Ok(Json(page))
}

pub async fn delete_migration(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let user_id = require_owner(&state, &headers)?;
    let record = load_record(&state, &id).await?;
    if !owns(&record, &user_id) {
        return Err(ClusterError::Forbidden(format!("migration {id} is not owned by this user")));
    }
    if let Some(path) = &record.package_file_path {
        let _ = tokio::fs::remove_file(path).await;
    }
    let _ = state
        .store
        .delete(crate::migration::rollback::ROLLBACK_SNAPSHOTS_COLLECTION, &id)
        .await;
    state.store.delete(MIGRATIONS_COLLECTION, &id).await?;
    state
        .audit
        .log_security_event(
            SecurityEventType::MigrationDeleted,
            Some(&user_id),
            record.tenant_id.as_deref(),
            Some(&id),
            None,
            json!({}),
        )
        .await?;
    Ok(Json(json!({"status": "deleted", "migration_id": id})))
}

pub async fn list_collections(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
) -> Result<Json<Vec<String>>> {
    require_owner(&state, &headers)?;
    Ok(Json(state.store.list_collections().await?))
}

pub async fn status(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<MigrationRecord>> {
    let user_id = require_owner(&state, &headers)?;
    let record = load_record(&state, &id).await?;
    if !owns(&record, &user_id) {
        return Err(ClusterError::Forbidden(format!("migration {id} is not owned by this user")));
    }
    Ok(Json(record))
}

pub async fn migration_health(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    require_owner(&state, &headers)?;
    let locked = state
        .migration_lock
        .is_locked(&state.node_id)
        .await
        .unwrap_or(false);
    Ok(Json(json!({
        "status": "healthy",
        "storage_dir": state.config.migration_storage_dir,
        "rate_limit_locked_sample": locked,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RegisterInstanceRequest {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
}

pub async fn register_instance(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Json(req): Json<RegisterInstanceRequest>,
) -> Result<Json<RemoteInstance>> {
    let user_id = require_owner(&state, &headers)?;
    let instance = state
        .instances
        .register(&user_id, &req.name, &req.base_url, &req.api_key, req.capacity_bytes, &state.instance_key_material)
        .await?;
    Ok(Json(instance))
}

pub async fn list_instances(State(state): State<ClusterHandle>, headers: HeaderMap) -> Result<Json<Vec<RemoteInstance>>> {
    let user_id = require_owner(&state, &headers)?;
    Ok(Json(state.instances.list(&user_id).await?))
}

pub async fn delete_instance(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let user_id = require_owner(&state, &headers)?;
    let instance = state.instances.require(&id).await?;
    if instance.owner_id != user_id {
        return Err(ClusterError::Forbidden(format!("instance {id} is not owned by this user")));
    }
    state.instances.delete(&id).await?;
    Ok(Json(json!({"status": "deleted", "instance_id": id})))
}

#[derive(Debug, Deserialize)]
pub struct CreateTransferRequest {
    pub source_instance_id: String,
    pub target_instance_id: String,
    pub collections: Vec<String>,
    #[serde(default)]
    pub conflict_policy: ConflictResolutionPolicy,
    #[serde(default)]
    pub bandwidth_limit_bytes_per_second: Option<u64>,
}

/// Creates a pending transfer record and starts it in the background, so the
/// handler returns immediately with an id callers poll via `status`. Matches
/// the fire-and-poll shape `/migration/export` + `/migration/{id}/status`
/// already uses for the package-based path.
pub async fn create_transfer(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Json(req): Json<CreateTransferRequest>,
) -> Result<Json<TransferRecord>> {
    let user_id = require_owner(&state, &headers)?;
    let target = state.instances.require(&req.target_instance_id).await?;
    if target.owner_id != user_id {
        return Err(ClusterError::Forbidden(format!(
            "instance {} is not owned by this user",
            req.target_instance_id
        )));
    }
    let api_key = state.instances.decrypt_api_key(&target, &state.instance_key_material)?;

    let record = TransferRecord::new_pending(
        &req.source_instance_id,
        &req.target_instance_id,
        req.collections,
        req.conflict_policy,
        req.bandwidth_limit_bytes_per_second,
        &user_id,
    );
    state.transfers.create(&record).await?;

    let transfers = state.transfers.clone();
    let store = state.store.clone();
    let transfer_id = record.transfer_id.clone();
    tokio::spawn(async move {
        if let Err(e) = transfers.run(&transfer_id, &store, &target, &api_key).await {
            tracing::error!(transfer_id, error = %e, "direct transfer failed to run");
        }
    });

    Ok(Json(record))
}

pub async fn get_transfer(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<TransferRecord>> {
    require_owner(&state, &headers)?;
    Ok(Json(state.transfers.load(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub source_instance_id: String,
    pub target_instance_id: String,
    pub collections: Vec<String>,
    #[serde(default)]
    pub conflict_policy: ConflictResolutionPolicy,
    pub cron_expression: String,
}

pub async fn create_schedule(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<Json<ScheduledMigration>> {
    let user_id = require_owner(&state, &headers)?;
    let schedule = state
        .schedules
        .create(
            &user_id,
            &req.source_instance_id,
            &req.target_instance_id,
            req.collections,
            req.conflict_policy,
            &req.cron_expression,
        )
        .await?;
    Ok(Json(schedule))
}

pub async fn list_schedules(State(state): State<ClusterHandle>, headers: HeaderMap) -> Result<Json<Vec<ScheduledMigration>>> {
    let user_id = require_owner(&state, &headers)?;
    Ok(Json(state.schedules.list(&user_id).await?))
}

pub async fn delete_schedule(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let user_id = require_owner(&state, &headers)?;
    let schedule = state
        .schedules
        .get(&id)
        .await?
        .ok_or_else(|| ClusterError::NotFound(format!("schedule {id}")))?;
    if schedule.owner_id != user_id {
        return Err(ClusterError::Forbidden(format!("schedule {id} is not owned by this user")));
    }
    state.schedules.delete(&id).await?;
    Ok(Json(json!({"status": "deleted", "schedule_id": id})))
}

/// Receives one chunk of a direct transfer's collection payload. Authenticates
/// like every other inter-node endpoint via `X-Cluster-Token` rather than
/// `X-User-Id`, since the sender is a peer instance, not an interactive
/// tenant. Chunks accumulate in `ClusterHandle::transfer_inbox` keyed by
/// `transfer_id:collection`; the chunk marked `X-Transfer-Final: true`
/// triggers decode-and-apply of the whole accumulated payload.
pub async fn receive_transfer_chunk(
    State(state): State<ClusterHandle>,
    headers: HeaderMap,
    Path((transfer_id, collection)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>> {
    crate::api::require_cluster_token(&headers, &state.config.cluster_auth_token)?;
    let is_final = headers
        .get("x-transfer-final")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let key = format!("{transfer_id}:{collection}");
    state
        .transfer_inbox
        .entry(key.clone())
        .or_default()
        .extend_from_slice(&body);

    if !is_final {
        return Ok(Json(json!({"status": "buffered"})));
    }

    let (_, bytes) = state
        .transfer_inbox
        .remove(&key)
        .ok_or_else(|| ClusterError::Internal("transfer chunk buffer vanished".to_string()))?;
    let entries: Vec<Value> = serde_json::from_slice(&bytes)?;

    let conflict_policy = match state.transfers.load(&transfer_id).await {
        Ok(record) => record.conflict_policy,
        Err(_) => ConflictResolutionPolicy::Overwrite,
    };

    let mut applied = 0u64;
    for entry in entries {
        let id = entry
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClusterError::Validation("transfer entry missing id".to_string()))?;
        let doc = entry
            .get("doc")
            .cloned()
            .ok_or_else(|| ClusterError::Validation("transfer entry missing doc".to_string()))?;

        match state.store.insert(&collection, id, doc.clone()).await {
            Ok(()) => {}
            Err(ClusterError::AlreadyExists(_)) => match conflict_policy {
                ConflictResolutionPolicy::Skip => continue,
                ConflictResolutionPolicy::Fail => {
                    return Err(ClusterError::Conflict(format!("document {id} already exists in {collection}")));
                }
                ConflictResolutionPolicy::Overwrite => {
                    state.store.replace(&collection, id, doc).await?;
                }
            },
            Err(e) => return Err(e),
        }
        applied += 1;
    }

    Ok(Json(json!({"status": "applied", "collection": collection, "documents_applied": applied})))
}

