use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::AgentError;

/// Environment variable overriding copilot binary discovery.
pub const CLI_BINARY_ENV: &str = "COPILOT_BINARY";

#[cfg(unix)]
const BINARY_NAME: &str = "copilot";

#[cfg(windows)]
const WINDOWS_BINARY_CANDIDATES: &[&str] = &["copilot.exe", "copilot.cmd", "copilot.bat"];

/// Locates the copilot executable.
///
/// Resolution order: explicit override, `COPILOT_BINARY`, `PATH`, then
/// platform-known install locations. Every candidate that was checked is
/// reported when the search fails.
pub fn resolve_binary(override_path: Option<&Path>) -> Result<PathBuf, AgentError> {
    let mut searched = Vec::new();

    if let Some(path) = override_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        searched.push(path.to_path_buf());
    }

    if let Ok(env_path) = std::env::var(CLI_BINARY_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        searched.push(path);
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            for candidate in binary_candidates(&dir) {
                if candidate.exists() {
                    debug!(path = %candidate.display(), "resolved copilot from PATH");
                    return Ok(candidate);
                }
            }
        }
        searched.push(PathBuf::from("$PATH"));
    }

    for dir in known_install_dirs() {
        for candidate in binary_candidates(&dir) {
            if candidate.exists() {
                debug!(path = %candidate.display(), "resolved copilot from known location");
                return Ok(candidate);
            }
            searched.push(candidate);
        }
    }

    Err(AgentError::CliNotFound { searched })
}

#[cfg(unix)]
fn binary_candidates(dir: &Path) -> Vec<PathBuf> {
    vec![dir.join(BINARY_NAME)]
}

#[cfg(windows)]
fn binary_candidates(dir: &Path) -> Vec<PathBuf> {
    WINDOWS_BINARY_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .collect()
}

#[cfg(unix)]
fn known_install_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".local/bin"));
        dirs.push(home.join(".npm-global/bin"));
    }
    dirs.push(PathBuf::from("/usr/local/bin"));
    dirs.push(PathBuf::from("/opt/homebrew/bin"));
    dirs
}

#[cfg(windows)]
fn known_install_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(appdata) = std::env::var_os("APPDATA") {
        dirs.push(PathBuf::from(appdata).join("npm"));
    }
    if let Some(local) = std::env::var_os("LOCALAPPDATA") {
        dirs.push(PathBuf::from(local).join("Programs").join("copilot"));
    }
    dirs
}

/// Builds the `copilot --acp --stdio --allow-all` invocation.
///
/// On Windows, `.cmd`/`.bat` shims run through the command processor and
/// the console window is hidden.
pub fn build_command(binary: &Path, model: Option<&str>, add_dirs: &[PathBuf]) -> Command {
    let mut command = base_command(binary);
    command.arg("--acp").arg("--stdio").arg("--allow-all");
    if let Some(model) = model {
        command.arg("--model").arg(model);
    }
    for dir in add_dirs {
        command.arg("--add-dir").arg(dir);
    }
    command
}

#[cfg(unix)]
fn base_command(binary: &Path) -> Command {
    Command::new(binary)
}

#[cfg(windows)]
fn base_command(binary: &Path) -> Command {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    let needs_shell = binary
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("cmd") || ext.eq_ignore_ascii_case("bat"))
        .unwrap_or(false);
    let mut command = if needs_shell {
        let mut command = Command::new("cmd.exe");
        command.arg("/C").arg(binary);
        command
    } else {
        Command::new(binary)
    };
    command.creation_flags(CREATE_NO_WINDOW);
    command
}
