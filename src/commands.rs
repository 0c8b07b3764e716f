//! Command execution.

use crate::config::Config;
use colored::Colorize;
use serde_json::Value;
use statewright_core::{Design, DesignDef, Machine, Snapshot, StateKind, StateTree};
use std::path::Path;
use std::time::Duration;

/// One line of a script or REPL input that drives the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptLine {
    Blank,
    Send { event: String, payload: Value },
    Wait(Duration),
    Reset,
}

/// Parses `EVENT [payload-json]`, `wait <seconds>` or `reset`. `#` starts a comment.
pub fn parse_script_line(line: &str) -> Result<ScriptLine, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(ScriptLine::Blank);
    }

    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    match head {
        "wait" => {
            let invalid = || format!("invalid wait duration '{}'", rest);
            let secs: f64 = rest.parse().map_err(|_| invalid())?;
            let duration = Duration::try_from_secs_f64(secs).map_err(|_| invalid())?;
            Ok(ScriptLine::Wait(duration))
        }
        "reset" if rest.is_empty() => Ok(ScriptLine::Reset),
        event => {
            let payload = if rest.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(rest).map_err(|e| format!("invalid payload JSON: {}", e))?
            };
            Ok(ScriptLine::Send {
                event: event.to_string(),
                payload,
            })
        }
    }
}

/// Reads a design file, choosing the format by extension.
pub fn load_design(path: &Path, config: &Config) -> Result<Design, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read design '{}': {}", path.display(), e))?;

    let mut design = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Design::new(DesignDef::from_json_str(&text)?),
        Some("yaml") | Some("yml") => Design::from_yaml_str(&text)?,
        _ => {
            return Err(format!(
                "unsupported design file '{}': expected .json, .yaml or .yml",
                path.display()
            )
            .into())
        }
    };

    if let Some(limit) = config.machine.log_limit {
        design.def.options.log_limit = limit;
    }
    Ok(design)
}

/// Compiles a design and summarizes it.
pub fn check(design: &Design) -> Result<String, Box<dyn std::error::Error>> {
    match StateTree::compile(design) {
        Ok(tree) => {
            let events = statewright_core::introspect::all_events(&tree).len();
            Ok(format!(
                "{} design {} ({} states, {} event handlers, checksum: {:08x})",
                "Valid".green(),
                design.def.id.cyan(),
                tree.len(),
                events,
                tree.checksum()
            ))
        }
        Err(e) => Err(format!("{} [{}]: {}", "Invalid".red(), e.error_code(), e).into()),
    }
}

/// Indented state listing.
pub fn states(tree: &StateTree) -> String {
    let mut output = String::new();
    for info in statewright_core::introspect::flat_states(tree) {
        let kind = match info.kind {
            StateKind::Atomic => String::new(),
            kind => format!(" ({})", kind),
        };
        let repeat = if info.has_repeat {
            format!(" {}", "[repeat]".yellow())
        } else {
            String::new()
        };
        let events = if info.events.is_empty() {
            String::new()
        } else {
            format!("  {}", info.events.join(" ").dimmed())
        };
        output.push_str(&format!(
            "{}{}{}{}{}\n",
            "  ".repeat(info.depth),
            info.name.cyan(),
            kind,
            repeat,
            events
        ));
    }
    output
}

/// Each event with the states that handle it.
pub fn events(tree: &StateTree) -> String {
    let index = statewright_core::introspect::events_by_state(tree);
    if index.is_empty() {
        return "No events".yellow().to_string();
    }
    let width = index.keys().map(String::len).max().unwrap_or(0);
    let mut output = String::new();
    for (event, states) in index {
        output.push_str(&format!(
            "{:width$}  {}\n",
            event,
            states.join(", ").cyan(),
            width = width
        ));
    }
    output
}

/// One-line summary of a snapshot.
pub fn format_snapshot(snapshot: &Snapshot) -> String {
    format!(
        "{} {} {}",
        format!("#{}", snapshot.cycle()).dimmed(),
        snapshot.active_paths().join(", ").cyan(),
        snapshot.data()
    )
}

pub fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Runs a script against a fresh machine, printing a line per cycle.
pub async fn run(
    design: Design,
    script: &str,
    json: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    let machine = Machine::new(design)?;
    let mut output = String::new();

    let mut last = machine.settled().await?;
    output.push_str(&format_snapshot(&last));
    output.push('\n');

    for (n, line) in script.lines().enumerate() {
        let step = parse_script_line(line).map_err(|e| format!("line {}: {}", n + 1, e))?;
        let snapshot = match step {
            ScriptLine::Blank => continue,
            ScriptLine::Send { event, payload } => machine.send_and_wait(event, payload).await?,
            ScriptLine::Reset => machine.reset_and_wait().await?,
            ScriptLine::Wait(duration) => {
                tokio::time::sleep(duration).await;
                machine.settled().await?
            }
        };
        if snapshot.cycle() != last.cycle() {
            output.push_str(&format_snapshot(&snapshot));
            output.push('\n');
        }
        last = snapshot;
    }

    if json {
        output.push_str(&format_json(&serde_json::to_value(&*last)?));
        output.push('\n');
    } else if !last.log().is_empty() {
        output.push_str(&format!("{}\n", "Log:".bold()));
        for entry in last.log() {
            output.push_str(&format!("  {}\n", entry.dimmed()));
        }
    }

    machine.destroy();
    Ok(output)
}
