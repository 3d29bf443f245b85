use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

pub const DEFAULT_DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_DIAGNOSTIC_CHARS: usize = 1000;

/// Resolve a service's binary, preferring whichever configured path exists.
///
/// Relative paths are taken from the directory of the running executable.
pub fn resolve_binary_path(primary: &str, alternate: Option<&str>) -> Option<PathBuf> {
    let base = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    resolve_binary_path_in(&base, primary, alternate)
}

pub fn resolve_binary_path_in(base: &Path, primary: &str, alternate: Option<&str>) -> Option<PathBuf> {
    let resolve = |raw: &str| {
        let raw = raw.trim();
        (!raw.is_empty()).then(|| base.join(raw))
    };

    let primary = resolve(primary);
    if primary.as_deref().is_some_and(Path::exists) {
        return primary;
    }

    let alternate = alternate.and_then(resolve);
    if alternate.as_deref().is_some_and(Path::exists) {
        return alternate;
    }

    primary.or(alternate)
}

/// Run `binary` with no arguments and return what it printed, stderr first.
///
/// The child is killed if it outlives `timeout`, in which case the result
/// is empty. Output is trimmed and capped at `MAX_DIAGNOSTIC_CHARS`.
pub async fn capture_output(binary: &Path, timeout: Duration) -> String {
    if !binary.is_file() {
        debug!(binary = %binary.display(), "no binary to diagnose");
        return String::new();
    }

    let child = Command::new(binary)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => {
            warn!(binary = %binary.display(), error = %e, "failed to spawn for diagnostics");
            return String::new();
        }
    };

    // Dropping the pending future drops the child, which kills it.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(binary = %binary.display(), error = %e, "diagnostic run failed");
            return String::new();
        }
        Err(_) => {
            warn!(binary = %binary.display(), ?timeout, "diagnostic run timed out, killed");
            return String::new();
        }
    };

    let stderr = String::from_utf8_lossy(&output.stderr);
    let text = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    truncate(text, MAX_DIAGNOSTIC_CHARS)
}

fn truncate(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text,
    }
}
