//! Check command implementation.

use super::load;
use chatsync_testkit::{Scenario, Step};
use std::collections::BTreeMap;
use std::path::Path;

/// Runs the check command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = load(path)?;
    print!("{}", describe(&scenario)?);
    Ok(())
}

/// Short name of a step, as written in scripts.
pub fn step_name(step: &Step) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(step)?;
    Ok(value["step"].as_str().unwrap_or("?").to_string())
}

/// Lists the setup and the steps of a scenario.
pub fn describe(scenario: &Scenario) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    let name = if scenario.name.is_empty() {
        "(unnamed)"
    } else {
        scenario.name.as_str()
    };
    out.push_str(&format!("Scenario {name}: OK\n"));
    out.push_str(&format!(
        "  {} contacts, {} chats, {} steps\n",
        scenario.contacts.len(),
        scenario.chats.len(),
        scenario.steps.len()
    ));

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for step in &scenario.steps {
        *counts.entry(step_name(step)?).or_default() += 1;
    }
    for (name, count) in counts {
        out.push_str(&format!("  {name:<14} x{count}\n"));
    }
    Ok(out)
}
