//! The mutation map
//!
//! A static table from event kind to typed graph mutation: which node to
//! upsert, under which stable key, with which relations and status guard.
//! Kinds without an entry are counted as unhandled and never guessed at.

use events::{Event, EventKind};
use graphstore::{NodeLabel, RelationSpec, StatusGuard, UpsertSpec};
use serde_json::{json, Value};
use tooling::redact::derive_id;

/// The canonical freshness layers, named by the deployment
pub const LAYERS: [&str; 12] = [
    "runs",
    "steps",
    "providers",
    "flags",
    "tasks",
    "approvals",
    "actions",
    "artifacts",
    "sources",
    "components",
    "voice",
    "workers",
];

/// A typed mutation derived from one event
#[derive(Debug, Clone)]
pub struct Mutation {
    /// Mutation kind, part of the dedupe id
    pub mutation_kind: &'static str,
    /// Stable key, part of the dedupe id
    pub stable_key: String,
    /// Upserts to apply, in order
    pub upserts: Vec<UpsertSpec>,
    /// Component whose freshness this mutation touches
    pub touched_component: Option<String>,
    /// Freshness layer to stamp
    pub layer: &'static str,
}

fn run_guard() -> StatusGuard {
    StatusGuard::on_status(&[("running", &["ok", "degraded"])])
}

fn step_guard() -> StatusGuard {
    StatusGuard::on_status(&[("running", &["success", "failed", "stale"])])
}

fn task_guard() -> StatusGuard {
    StatusGuard::on_status(&[
        ("queued", &["waiting_approval", "running", "canceled", "failed"]),
        ("waiting_approval", &["running", "canceled", "failed"]),
        ("running", &["done", "failed", "canceled"]),
    ])
}

fn approval_guard() -> StatusGuard {
    StatusGuard::on_status(&[("pending", &["approved", "rejected", "expired"])])
}

fn action_guard() -> StatusGuard {
    StatusGuard::on_status(&[
        ("pending", &["running", "success", "failed"]),
        ("running", &["success", "failed"]),
    ])
}

fn str_of<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(|v| v.as_str())
}

fn num_of(payload: &Value, key: &str) -> Option<u64> {
    payload.get(key).and_then(|v| v.as_u64())
}

/// Map an already-redacted event to its graph mutation.
///
/// Returns `None` for kinds without a map entry and for events whose
/// payload is missing required keys; both count as unhandled.
pub fn map_event(event: &Event) -> Option<Mutation> {
    let payload = &event.payload;
    let ts = event.ts.to_rfc3339();

    match &event.kind {
        EventKind::ChatMessage => {
            let run_id = str_of(payload, "run_id")?;
            Some(Mutation {
                mutation_kind: "run_started",
                stable_key: run_id.to_string(),
                upserts: vec![UpsertSpec::new(NodeLabel::Run, run_id)
                    .with_props(json!({"status": "running", "ts": ts}))
                    .with_guard(run_guard())],
                touched_component: Some("chat_cp".to_string()),
                layer: "runs",
            })
        }

        EventKind::RunStep => {
            let run_id = str_of(payload, "run_id")?;
            let name = str_of(payload, "name")?;
            let status = str_of(payload, "status")?;
            let order = num_of(payload, "order")?;
            let step_id = derive_id(&[run_id, name]);

            let mut step_props = json!({
                "name": name,
                "status": status,
                "order": order,
            });
            if let Some(latency) = num_of(payload, "latency_ms") {
                step_props["latency_ms"] = json!(latency);
            }
            if let Some(reason) = str_of(payload, "reason") {
                step_props["reason"] = json!(reason);
            }

            let mut upserts = vec![UpsertSpec::new(NodeLabel::Step, &step_id)
                .with_props(step_props)
                .with_guard(step_guard())
                .with_relation(
                    RelationSpec::new(
                        (NodeLabel::Run, run_id),
                        "HAS_STEP",
                        (NodeLabel::Step, step_id.as_str()),
                    )
                    .with_props(json!({"order": order})),
                )
                .with_relation(RelationSpec::new(
                    (NodeLabel::Step, step_id.as_str()),
                    "TOUCHED",
                    (NodeLabel::Component, "chat_cp"),
                ))];

            if let Some(run_status) = str_of(payload, "run_status") {
                let mut run_props = json!({"status": run_status});
                if let Some(latency) = num_of(payload, "latency_ms") {
                    run_props["latency_ms"] = json!(latency);
                }
                if let Some(picked) = str_of(payload, "picked_provider") {
                    run_props["picked_provider"] = json!(picked);
                }
                if let Some(fallbacks) = num_of(payload, "fallbacks_count") {
                    run_props["fallbacks_count"] = json!(fallbacks);
                }
                upserts.push(
                    UpsertSpec::new(NodeLabel::Run, run_id)
                        .with_props(run_props)
                        .with_guard(run_guard()),
                );
            }

            Some(Mutation {
                mutation_kind: "step_recorded",
                stable_key: format!("{}:{}", run_id, name),
                upserts,
                touched_component: Some("chat_cp".to_string()),
                layer: "steps",
            })
        }

        EventKind::ChatRateLimited => {
            let run_id = str_of(payload, "run_id")?;
            Some(Mutation {
                mutation_kind: "run_rate_limited",
                stable_key: run_id.to_string(),
                upserts: vec![UpsertSpec::new(NodeLabel::Run, run_id)
                    .with_props(json!({"status": "degraded", "blocked_reason": "rate_limited"}))
                    .with_guard(run_guard())],
                touched_component: Some("rate_limiter".to_string()),
                layer: "runs",
            })
        }

        EventKind::ProviderUsed => {
            let run_id = str_of(payload, "run_id")?;
            let provider_id = str_of(payload, "provider_id")?;
            let role = str_of(payload, "role")?;

            let mut provider_props = json!({"kind": "chat"});
            let mut edge_props = json!({"role": role});
            if let Some(error_kind) = str_of(payload, "error_kind") {
                provider_props["last_err_ts"] = json!(ts);
                provider_props["last_error_kind"] = json!(error_kind);
                edge_props["error_kind"] = json!(error_kind);
            } else {
                provider_props["last_ok_ts"] = json!(ts);
            }

            Some(Mutation {
                mutation_kind: "provider_used",
                stable_key: format!("{}:{}:{}", run_id, provider_id, role),
                upserts: vec![UpsertSpec::new(NodeLabel::Provider, provider_id)
                    .with_props(provider_props)
                    .with_relation(
                        RelationSpec::new(
                            (NodeLabel::Run, run_id),
                            "USED_PROVIDER",
                            (NodeLabel::Provider, provider_id),
                        )
                        .with_props(edge_props),
                    )],
                touched_component: Some("router".to_string()),
                layer: "providers",
            })
        }

        EventKind::TaskCreated => {
            let task_id = str_of(payload, "task_id")?;
            let status = str_of(payload, "status").unwrap_or("queued");

            let mut spec = UpsertSpec::new(NodeLabel::Task, task_id)
                .with_props(json!({
                    "status": status,
                    "priority": str_of(payload, "priority").unwrap_or("normal"),
                    "requester": str_of(payload, "requester").unwrap_or("unknown"),
                    "reason_safe": str_of(payload, "reason_safe").unwrap_or(""),
                    "payload_redacted_hash": str_of(payload, "payload_redacted_hash").unwrap_or(""),
                    "created_ts": ts,
                }))
                .with_guard(task_guard());
            if let Some(run_id) = str_of(payload, "run_id") {
                spec = spec.with_relation(RelationSpec::new(
                    (NodeLabel::Task, task_id),
                    "SPAWNS",
                    (NodeLabel::Run, run_id),
                ));
            }

            Some(Mutation {
                mutation_kind: "task_created",
                stable_key: task_id.to_string(),
                upserts: vec![spec],
                touched_component: Some("control_room".to_string()),
                layer: "tasks",
            })
        }

        EventKind::TaskUpdated => {
            let task_id = str_of(payload, "task_id")?;
            let status = str_of(payload, "status")?;
            Some(Mutation {
                mutation_kind: "task_updated",
                stable_key: format!("{}:{}", task_id, status),
                upserts: vec![UpsertSpec::new(NodeLabel::Task, task_id)
                    .with_props(json!({"status": status, "updated_ts": ts}))
                    .with_guard(task_guard())],
                touched_component: Some("control_room".to_string()),
                layer: "tasks",
            })
        }

        EventKind::TaskFailed => {
            let task_id = str_of(payload, "task_id")?;
            let mut props = json!({"status": "failed", "updated_ts": ts});
            if let Some(reason) = str_of(payload, "reason") {
                props["reason_safe"] = json!(reason);
            }
            Some(Mutation {
                mutation_kind: "task_failed",
                stable_key: task_id.to_string(),
                upserts: vec![UpsertSpec::new(NodeLabel::Task, task_id)
                    .with_props(props)
                    .with_guard(task_guard())],
                touched_component: Some("worker_pool".to_string()),
                layer: "tasks",
            })
        }

        EventKind::ApprovalRequested => {
            let approval_id = str_of(payload, "approval_id")?;
            let policy_id = str_of(payload, "policy_id")?;

            let mut spec = UpsertSpec::new(NodeLabel::Approval, approval_id)
                .with_props(json!({
                    "status": "pending",
                    "policy_id": policy_id,
                    "scope": str_of(payload, "scope").unwrap_or("run"),
                    "requested_ts": ts,
                }))
                .with_guard(approval_guard());
            if let Some(task_id) = str_of(payload, "task_id") {
                spec = spec.with_relation(RelationSpec::new(
                    (NodeLabel::Task, task_id),
                    "REQUIRES_APPROVAL",
                    (NodeLabel::Approval, approval_id),
                ));
            }
            if let Some(run_id) = str_of(payload, "run_id") {
                spec = spec.with_relation(RelationSpec::new(
                    (NodeLabel::Approval, approval_id),
                    "GOVERNS",
                    (NodeLabel::Run, run_id),
                ));
            }

            Some(Mutation {
                mutation_kind: "approval_requested",
                stable_key: approval_id.to_string(),
                upserts: vec![spec],
                touched_component: Some("policy_engine".to_string()),
                layer: "approvals",
            })
        }

        EventKind::ApprovalResolved => {
            let approval_id = str_of(payload, "approval_id")?;
            let status = str_of(payload, "status")?;
            if !matches!(status, "approved" | "rejected" | "expired") {
                return None;
            }
            Some(Mutation {
                mutation_kind: "approval_resolved",
                stable_key: approval_id.to_string(),
                upserts: vec![UpsertSpec::new(NodeLabel::Approval, approval_id)
                    .with_props(json!({
                        "status": status,
                        "resolved_by": str_of(payload, "resolved_by").unwrap_or("system"),
                        "resolved_ts": ts,
                    }))
                    .with_guard(approval_guard())],
                touched_component: Some("policy_engine".to_string()),
                layer: "approvals",
            })
        }

        EventKind::ActionExecuted => {
            let action_id = str_of(payload, "action_id")?;
            let tool = str_of(payload, "tool")?;
            let status = str_of(payload, "status")?;

            let mut spec = UpsertSpec::new(NodeLabel::Action, action_id)
                .with_props(json!({
                    "tool": tool,
                    "status": status,
                    "args_redacted_hash": str_of(payload, "args_redacted_hash").unwrap_or(""),
                    "result_redacted_hash": str_of(payload, "result_redacted_hash").unwrap_or(""),
                    "ts": ts,
                }))
                .with_guard(action_guard());
            if let (Some(run_id), Some(step_name)) =
                (str_of(payload, "run_id"), str_of(payload, "step_name"))
            {
                let step_id = derive_id(&[run_id, step_name]);
                spec = spec.with_relation(
                    RelationSpec::new(
                        (NodeLabel::Step, step_id),
                        "HAS_ACTION",
                        (NodeLabel::Action, action_id),
                    )
                    .with_props(json!({"order": num_of(payload, "order").unwrap_or(1)})),
                );
            }

            Some(Mutation {
                mutation_kind: "action_executed",
                stable_key: format!("{}:{}", action_id, status),
                upserts: vec![spec],
                touched_component: Some("chat_cp".to_string()),
                layer: "actions",
            })
        }

        EventKind::ArtifactProduced => {
            let artifact_id = str_of(payload, "artifact_id")?;
            let kind = str_of(payload, "kind")?;

            let mut spec = UpsertSpec::new(NodeLabel::Artifact, artifact_id).with_props(json!({
                "kind": kind,
                "counts_json": str_of(payload, "counts_json").unwrap_or("{}"),
                "ts": ts,
            }));
            if let (Some(run_id), Some(step_name)) =
                (str_of(payload, "run_id"), str_of(payload, "step_name"))
            {
                let step_id = derive_id(&[run_id, step_name]);
                spec = spec.with_relation(RelationSpec::new(
                    (NodeLabel::Step, step_id),
                    "PRODUCED",
                    (NodeLabel::Artifact, artifact_id),
                ));
            }
            if let Some(source_id) = str_of(payload, "source_id") {
                spec = spec.with_relation(RelationSpec::new(
                    (NodeLabel::Artifact, artifact_id),
                    "FROM_SOURCE",
                    (NodeLabel::Source, source_id),
                ));
            }

            Some(Mutation {
                mutation_kind: "artifact_produced",
                stable_key: artifact_id.to_string(),
                upserts: vec![spec],
                touched_component: Some("chat_cp".to_string()),
                layer: "artifacts",
            })
        }

        EventKind::SourceSeen => {
            let source_id = str_of(payload, "source_id")?;
            Some(Mutation {
                mutation_kind: "source_seen",
                stable_key: source_id.to_string(),
                upserts: vec![UpsertSpec::new(NodeLabel::Source, source_id).with_props(json!({
                    "kind": str_of(payload, "kind").unwrap_or("host"),
                    "last_seen_ts": ts,
                }))],
                touched_component: None,
                layer: "sources",
            })
        }

        EventKind::FeatureFlagUpdated => {
            let name = str_of(payload, "name")?;
            let value = str_of(payload, "value")?;
            Some(Mutation {
                mutation_kind: "flag_updated",
                stable_key: name.to_string(),
                upserts: vec![UpsertSpec::new(NodeLabel::FeatureFlag, name)
                    .with_props(json!({"value": value, "updated_ts": ts}))],
                touched_component: Some("config".to_string()),
                layer: "flags",
            })
        }

        EventKind::ComponentSeen => {
            let component_id = str_of(payload, "component_id")?;
            let mut props = json!({"freshness_ts": ts});
            if let Some(version) = str_of(payload, "version") {
                props["version"] = json!(version);
            }
            if let Some(status) = str_of(payload, "status") {
                props["status"] = json!(status);
            }
            Some(Mutation {
                mutation_kind: "component_seen",
                stable_key: component_id.to_string(),
                upserts: vec![UpsertSpec::new(NodeLabel::Component, component_id).with_props(props)],
                touched_component: Some(component_id.to_string()),
                layer: "components",
            })
        }

        EventKind::WorkerSeen => {
            let worker = str_of(payload, "worker")?;
            let component_id = format!("worker:{}", worker);
            Some(Mutation {
                mutation_kind: "worker_seen",
                stable_key: component_id.clone(),
                upserts: vec![UpsertSpec::new(NodeLabel::Component, &component_id)
                    .with_props(json!({"status": "ok", "freshness_ts": ts}))],
                touched_component: Some(component_id),
                layer: "workers",
            })
        }

        EventKind::AsyncFallbackSync => Some(Mutation {
            mutation_kind: "async_fallback",
            stable_key: "worker_pool".to_string(),
            upserts: vec![UpsertSpec::new(NodeLabel::Component, "worker_pool")
                .with_props(json!({"status": "degraded", "last_fallback_ts": ts}))],
            touched_component: Some("worker_pool".to_string()),
            layer: "workers",
        }),

        EventKind::VoiceSessionStarted | EventKind::VoiceAsrFinal | EventKind::VoiceTtsAudioReady => {
            let session_id = str_of(payload, "session_id")?;
            Some(Mutation {
                mutation_kind: "voice_activity",
                stable_key: format!("{}:{}", event.kind.as_str(), session_id),
                upserts: vec![UpsertSpec::new(NodeLabel::Component, "voice_bridge").with_props(
                    json!({
                        "status": "ok",
                        "freshness_ts": ts,
                        "last_event_kind": event.kind.as_str(),
                    }),
                )],
                touched_component: Some("voice_bridge".to_string()),
                layer: "voice",
            })
        }

        EventKind::VoiceError => Some(Mutation {
            mutation_kind: "voice_error",
            stable_key: str_of(payload, "session_id").unwrap_or("unknown").to_string(),
            upserts: vec![UpsertSpec::new(NodeLabel::Component, "voice_bridge").with_props(
                json!({
                    "status": "degraded",
                    "last_err_ts": ts,
                }),
            )],
            touched_component: Some("voice_bridge".to_string()),
            layer: "voice",
        }),

        EventKind::Other(_) => None,
    }
}
