//! Port advertisement
//!
//! The daemon binds an OS-assigned port, so external clients (the browser
//! companion, the CLI) discover it from two well-known files:
//! `<tmpdir>/pkm_assistant_port.txt` (bare decimal) and
//! `<home>/.pkm-assistant/port.json` (`{"port": N}`). Both are truncated on
//! shutdown so a stale port is never mistaken for a live one.

use std::io;
use std::path::PathBuf;

use tracing::warn;

use pkm_core::HOME_DIR_NAME;

const TMP_FILE_NAME: &str = "pkm_assistant_port.txt";

pub fn tmp_port_file() -> PathBuf {
    std::env::temp_dir().join(TMP_FILE_NAME)
}

pub fn home_port_file() -> Option<PathBuf> {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(HOME_DIR_NAME).join("port.json"))
}

/// Write the bound port to both discovery files.
pub fn advertise(port: u16) -> io::Result<()> {
    std::fs::write(tmp_port_file(), format!("{}", port))?;

    if let Some(path) = home_port_file() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{{\"port\": {}}}", port))?;
    }
    Ok(())
}

/// Truncate the discovery files. Failures are logged, not propagated; the
/// daemon is on its way out.
pub fn withdraw() {
    if let Err(e) = std::fs::write(tmp_port_file(), "") {
        warn!(error = %e, "Could not truncate tmp port file");
    }
    if let Some(path) = home_port_file() {
        if path.exists() {
            if let Err(e) = std::fs::write(path, "") {
                warn!(error = %e, "Could not truncate home port file");
            }
        }
    }
}

/// Read the advertised port back, if a daemon is (or was) running.
pub fn discover() -> Option<u16> {
    let text = std::fs::read_to_string(tmp_port_file()).ok()?;
    text.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertise_discover_withdraw() {
        advertise(43210).unwrap();
        assert_eq!(discover(), Some(43210));

        withdraw();
        assert_eq!(discover(), None);
    }
}
