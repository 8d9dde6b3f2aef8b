//! Replay command implementation.

use super::load;
use chatsync_testkit::Report;
use std::fmt::Write;
use std::path::Path;
use tracing::info;

/// Runs the replay command.
pub fn run(path: &Path, format: &str, strict: bool) -> Result<(), Box<dyn std::error::Error>> {
    let report = replay(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print!("{}", render_text(&report));
        }
    }

    if strict && !report.divergence.is_empty() {
        return Err(format!(
            "client diverged from server in {} place(s)",
            report.divergence.len()
        )
        .into());
    }
    Ok(())
}

/// Loads a scenario, runs it and summarises the outcome.
pub fn replay(path: &Path) -> Result<Report, Box<dyn std::error::Error>> {
    let scenario = load(path)?;
    let name = if scenario.name.is_empty() {
        path.display().to_string()
    } else {
        scenario.name.clone()
    };
    info!(scenario = %name, steps = scenario.steps.len(), "replaying");
    let harness = scenario.run()?;
    Ok(Report::from_harness(&name, &harness))
}

/// Renders a report for humans.
pub fn render_text(report: &Report) -> String {
    let mut out = String::new();
    let title = format!("Scenario: {}", report.name);
    let _ = writeln!(out, "{title}");
    let _ = writeln!(out, "{}", "=".repeat(title.len()));
    let _ = writeln!(out);
    let _ = writeln!(out, "Phase: {}", report.phase);
    let _ = writeln!(out);
    let _ = writeln!(out, "Counters:     pts    qts    seq    date");
    for (label, c) in [("client", &report.client), ("server", &report.server)] {
        let _ = writeln!(
            out,
            "  {label:<10} {:>5}  {:>5}  {:>5}  {:>6}",
            c.pts, c.qts, c.seq, c.date
        );
    }

    if !report.conversations.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Conversations:");
        for conv in &report.conversations {
            let top = conv.top.map_or_else(|| "-".to_string(), |id| id.to_string());
            let _ = writeln!(
                out,
                "  {:<10} {} messages, {} unread, top {}",
                conv.peer, conv.messages, conv.unread, top
            );
        }
    }

    if !report.windows.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Windows:");
        for window in &report.windows {
            let total = match window.total {
                -1 => "unknown".to_string(),
                0 => "complete".to_string(),
                n => n.to_string(),
            };
            let _ = writeln!(
                out,
                "  {:<20} {} items, total {}",
                window.window, window.items, total
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Activity:");
    let _ = writeln!(out, "  Resyncs:           {}", report.resyncs);
    let _ = writeln!(out, "  Batches discarded: {}", report.batches_discarded);
    let _ = writeln!(out, "  Pending sends:     {}", report.pending_sends);
    let _ = writeln!(out, "  Failed sends:      {}", report.sends_failed);

    let _ = writeln!(out);
    if report.divergence.is_empty() {
        let _ = writeln!(out, "Converged with server.");
    } else {
        let _ = writeln!(out, "Diverged from server:");
        for issue in &report.divergence {
            let _ = writeln!(out, "  {issue}");
        }
    }
    out
}
