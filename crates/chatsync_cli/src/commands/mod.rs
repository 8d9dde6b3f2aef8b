//! CLI command implementations.

pub mod check;
pub mod replay;

use chatsync_testkit::Scenario;
use std::path::Path;

/// Reads and parses a scenario file.
pub fn load(path: &Path) -> Result<Scenario, Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    Ok(Scenario::from_json(&json)?)
}
