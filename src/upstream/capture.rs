//! Best-effort capture of raw upstream response bodies to
//! `captures/{endpoint}/{timestamp}_{suffix}.json` for offline analysis.
//! Errors are logged and swallowed; capturing must never interrupt a poll.

use tokio::fs;
use tracing::warn;

/// Write `bytes` under `captures/{endpoint}/`. `suffix` is usually the
/// device key; pass `""` to omit.
pub async fn save(endpoint: &str, suffix: &str, bytes: &[u8]) {
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let filename = if suffix.is_empty() {
        format!("{ts}.json")
    } else {
        format!("{ts}_{suffix}.json")
    };

    let dir = format!("captures/{endpoint}");
    let path = format!("{dir}/{filename}");

    if let Err(e) = fs::create_dir_all(&dir).await {
        warn!(path = %path, error = %e, "capture: failed to create directory");
        return;
    }

    // Pretty-print when the body is valid JSON; raw bytes otherwise.
    let content = match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(v) => serde_json::to_vec_pretty(&v).unwrap_or_else(|_| bytes.to_vec()),
        Err(_) => bytes.to_vec(),
    };

    if let Err(e) = fs::write(&path, &content).await {
        warn!(path = %path, error = %e, "capture: failed to write response file");
    }
}
