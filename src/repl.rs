//! Interactive REPL.

use crate::commands::{self, ScriptLine};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use serde_json::Value;
use statewright_core::Machine;
use std::path::Path;

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help

  <EVENT> [payload]             Send an event (payload is JSON)
  send <EVENT> [payload]        Same as above
  wait <seconds>                Let timers run
  reset                         Restore initial data and states

  state                         Show active states and data
  values                        Show derived values
  log                           Show the event log
  in <state>                    Is the state active?
  can <EVENT> [payload]         Would the event do anything?

  states                        List all states
  events                        List all events

  quit, exit                    Exit the REPL
"#;

pub async fn run(machine: Machine, history_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "{} {}",
        "statewright".bold().cyan(),
        machine.tree().node(machine.tree().root()).name
    );

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;
    let _ = rl.load_history(history_path);

    let snapshot = machine.settled().await?;
    println!("{}", commands::format_snapshot(&snapshot));
    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "sw>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&machine, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    if let Err(e) = rl.save_history(history_path) {
        tracing::debug!(path = %history_path.display(), error = %e, "history not saved");
    }
    machine.destroy();

    Ok(())
}

async fn execute_repl_command(
    machine: &Machine,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };

    match cmd {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "state" | "s" => Ok(Some(commands::format_snapshot(&machine.snapshot()))),

        "values" => {
            let snapshot = machine.snapshot();
            Ok(Some(commands::format_json(&serde_json::to_value(
                snapshot.values(),
            )?)))
        }

        "log" => {
            let snapshot = machine.snapshot();
            if snapshot.log().is_empty() {
                return Ok(Some("Log is empty".yellow().to_string()));
            }
            Ok(Some(snapshot.log().join("\n")))
        }

        "in" => {
            if rest.is_empty() {
                return Ok(Some("Usage: in <state>".to_string()));
            }
            let snapshot = machine.snapshot();
            Ok(Some(match snapshot.find_active(rest) {
                Some(path) => format!("{} ({})", "yes".green(), path),
                None => "no".red().to_string(),
            }))
        }

        "can" => {
            let Some((event, payload)) = split_event(rest)? else {
                return Ok(Some("Usage: can <EVENT> [payload]".to_string()));
            };
            Ok(Some(if machine.can(event, &payload) {
                "yes".green().to_string()
            } else {
                "no".red().to_string()
            }))
        }

        "states" => Ok(Some(commands::states(machine.tree()))),

        "events" => Ok(Some(commands::events(machine.tree()))),

        "send" => {
            let Some((event, payload)) = split_event(rest)? else {
                return Ok(Some("Usage: send <EVENT> [payload]".to_string()));
            };
            let snapshot = machine.send_and_wait(event, payload).await?;
            Ok(Some(commands::format_snapshot(&snapshot)))
        }

        _ => {
            let snapshot = match commands::parse_script_line(line)? {
                ScriptLine::Blank => return Ok(Some(String::new())),
                ScriptLine::Send { event, payload } => {
                    machine.send_and_wait(event, payload).await?
                }
                ScriptLine::Reset => machine.reset_and_wait().await?,
                ScriptLine::Wait(duration) => {
                    tokio::time::sleep(duration).await;
                    machine.settled().await?
                }
            };
            Ok(Some(commands::format_snapshot(&snapshot)))
        }
    }
}

fn split_event(rest: &str) -> Result<Option<(&str, Value)>, Box<dyn std::error::Error>> {
    if rest.is_empty() {
        return Ok(None);
    }
    let (event, payload) = match rest.split_once(char::is_whitespace) {
        Some((event, payload)) => (event, serde_json::from_str(payload.trim())?),
        None => (rest, Value::Null),
    };
    Ok(Some((event, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use statewright_core::Design;

    fn machine() -> Machine {
        let design = Design::from_yaml_str(
            r#"
id: toggle
initial: toggledOff
states:
  toggledOff:
    on:
      TOGGLE: { to: toggledOn }
  toggledOn:
    on:
      TOGGLE: { to: toggledOff }
"#,
        )
        .unwrap();
        Machine::new(design).unwrap()
    }

    async fn exec(machine: &Machine, line: &str) -> String {
        execute_repl_command(machine, line).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_queries() {
        let machine = machine();
        machine.settled().await.unwrap();

        let active = exec(&machine, "in toggledOff").await;
        assert!(active.contains("toggle.toggledOff"));
        assert!(exec(&machine, "can TOGGLE").await.contains("yes"));
        assert!(exec(&machine, "can PUSH").await.contains("no"));
        assert!(exec(&machine, "in").await.starts_with("Usage"));
    }

    #[tokio::test]
    async fn test_bare_event_sends() {
        let machine = machine();
        let output = exec(&machine, "TOGGLE").await;
        assert!(output.contains("toggle.toggledOn"));
        assert!(machine.is_in("toggledOn"));

        exec(&machine, "send TOGGLE {}").await;
        assert!(machine.is_in("toggledOff"));
        assert!(exec(&machine, "log").await.contains("TOGGLE"));
    }

    #[tokio::test]
    async fn test_quit_and_bad_payload() {
        let machine = machine();
        let quit = execute_repl_command(&machine, "quit").await.unwrap();
        assert!(quit.is_none());
        assert!(execute_repl_command(&machine, "send TOGGLE {oops")
            .await
            .is_err());
    }
}
