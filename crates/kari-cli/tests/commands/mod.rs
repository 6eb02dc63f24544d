//! Per-command CLI tests and their shared fixtures.

mod check_test;
mod send_test;
mod serve_test;

use std::fs;
use std::path::{Path, PathBuf};

const PULSE_MATRIX_MANIFEST: &str =
    include_str!("../../../../modules/builtin/pulse_matrix/module.toml");
const VOICE_BOX_MANIFEST: &str = include_str!("../../../../modules/builtin/voice_box/module.toml");

/// Module roots holding the shipped manifests, plus a config pointing at
/// them with the socket inside `dir`. Returns the config path.
pub fn write_workspace(dir: &Path) -> PathBuf {
    let builtin = dir.join("builtin");
    for (unit, manifest) in [
        ("pulse_matrix", PULSE_MATRIX_MANIFEST),
        ("voice_box", VOICE_BOX_MANIFEST),
    ] {
        let unit_dir = builtin.join(unit);
        fs::create_dir_all(&unit_dir).unwrap();
        fs::write(unit_dir.join("module.toml"), manifest).unwrap();
    }
    fs::create_dir_all(dir.join("addons")).unwrap();

    let config = format!(
        r#"pulse_interval_secs = 0.2

[socket]
path = {socket:?}
fallback_path = {fallback:?}
mode = 0o600

[modules]
builtin_root = {builtin:?}
addon_root = {addons:?}
"#,
        socket = socket_path(dir).display().to_string(),
        fallback = dir.join("fallback.sock").display().to_string(),
        builtin = builtin.display().to_string(),
        addons = dir.join("addons").display().to_string(),
    );
    let path = dir.join("kari.toml");
    fs::write(&path, config).unwrap();
    path
}

pub fn socket_path(dir: &Path) -> PathBuf {
    dir.join("kari.sock")
}
