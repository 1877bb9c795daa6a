use std::sync::Arc;

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::oauth;
use crate::router::AppState;
use crate::sandbox::ContainerState;
use crate::store::keys;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub setup_complete: bool,
    pub container_status: String,
    pub claude_token_valid: bool,
    pub claude_token_expires_in_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault_last_push: Option<String>,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MonitorResponse {
    #[serde(flatten)]
    pub health: HealthResponse,
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_uptime_seconds: Option<u64>,
    pub usage: UsageSummary,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UsageSummary {
    pub sessions: u64,
    pub turns: u64,
    pub total_cost_usd: f64,
}

pub async fn snapshot(state: &Arc<AppState>) -> HealthResponse {
    let now = OffsetDateTime::now_utc();
    let setup_complete = state
        .store
        .get(keys::SETUP_COMPLETE)
        .ok()
        .flatten()
        .as_deref()
        == Some("true");

    let container_status = match &state.sandbox {
        Some(sandbox) => sandbox
            .state()
            .await
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
        None => "unconfigured".to_string(),
    };

    let expires_at = state
        .store
        .get(keys::TOKEN_EXPIRES_AT)
        .ok()
        .flatten()
        .and_then(|value| OffsetDateTime::parse(&value, &Rfc3339).ok());
    let token_expires_in = expires_at
        .map(|at| (at - now).whole_seconds())
        .unwrap_or(0);
    let token_valid = state.store.get(keys::OAUTH_TOKEN).ok().flatten().is_some()
        && !oauth::needs_refresh(expires_at, time::Duration::ZERO, now);

    let degraded = !setup_complete
        || !token_valid
        || matches!(
            (&state.sandbox, container_status.as_str()),
            (Some(_), "stopped") | (Some(_), "missing")
        );

    HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        setup_complete,
        container_status,
        claude_token_valid: token_valid,
        claude_token_expires_in_seconds: token_expires_in.max(0),
        vault_last_push: state.store.get(keys::VAULT_LAST_PUSH).ok().flatten(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

pub async fn monitor_snapshot(state: &Arc<AppState>) -> MonitorResponse {
    let health = snapshot(state).await;

    let (cpu_percent, memory_used, memory_total) = tokio::task::spawn_blocking(|| {
        let mut sys = sysinfo::System::new();
        sys.refresh_cpu();
        // A second sample after a short delay gives a usable usage figure.
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu();
        sys.refresh_memory();
        (
            sys.global_cpu_info().cpu_usage(),
            sys.used_memory(),
            sys.total_memory(),
        )
    })
    .await
    .unwrap_or((0.0, 0, 0));

    let (disk_used, disk_total) = tokio::task::spawn_blocking(|| {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let mut used = 0u64;
        let mut total = 0u64;
        for disk in disks.list() {
            total += disk.total_space();
            used += disk.total_space().saturating_sub(disk.available_space());
        }
        (used, total)
    })
    .await
    .unwrap_or((0, 0));

    let container_uptime = match &state.sandbox {
        Some(sandbox) if matches!(sandbox.state().await, Ok(ContainerState::Running)) => {
            sandbox.uptime_seconds().await
        }
        _ => None,
    };

    let totals = state.store.usage_totals().unwrap_or_default();

    MonitorResponse {
        health,
        cpu_percent,
        memory_used_bytes: memory_used,
        memory_total_bytes: memory_total,
        disk_used_bytes: disk_used,
        disk_total_bytes: disk_total,
        container_uptime_seconds: container_uptime,
        usage: UsageSummary {
            sessions: totals.sessions,
            turns: totals.turns,
            total_cost_usd: totals.cost_usd,
        },
    }
}
