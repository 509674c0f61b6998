//! Interactive operator console on stdin.
//!
//! Reads one command per line: `pause`, `resume` or `exit`. Runs on its own OS
//! thread because a blocked stdin read must not hold up runtime shutdown.

use std::io::BufRead;
use std::str::FromStr;
use std::thread::JoinHandle;
use tracing::{debug, warn};

use crate::scan::orchestrator::ScanHandle;

/// An operator command read from the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Hold all loops
    Pause,
    /// Continue after a pause
    Resume,
    /// Stop the campaign (`exit`, `quit` or `stop`)
    Exit,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "exit" | "quit" | "stop" => Ok(Self::Exit),
            other => Err(format!(
                "invalid command '{other}', expected 'pause', 'resume' or 'exit'"
            )),
        }
    }
}

/// Apply one command to the scan. Returns `true` when the console should close.
pub fn apply(command: ConsoleCommand, handle: &ScanHandle) -> bool {
    match command {
        ConsoleCommand::Pause => handle.pause(),
        ConsoleCommand::Resume => handle.resume(),
        ConsoleCommand::Exit => {
            handle.stop();
            return true;
        }
    }
    false
}

/// Process commands from `input` until `exit`, end of input or scan stop.
pub fn run_console<R: BufRead>(input: R, handle: &ScanHandle) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Console input failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<ConsoleCommand>() {
            Ok(command) => {
                debug!(?command, "Console command");
                if apply(command, handle) {
                    break;
                }
            }
            Err(message) => warn!("{message}"),
        }
        if handle.is_stopped() {
            break;
        }
    }
}

/// Spawn the console on a detached thread reading stdin.
pub fn spawn_stdin_console(handle: ScanHandle) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("smartscan-console".into())
        .spawn(move || {
            eprintln!("Type 'pause', 'resume' or 'exit'");
            run_console(std::io::stdin().lock(), &handle);
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::control::ScanControl;
    use std::io::Cursor;
    use std::sync::Arc;

    #[test]
    fn test_parse_commands() {
        assert_eq!("pause".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Pause));
        assert_eq!(" Resume \n".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Resume));
        assert_eq!("exit".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Exit));
        assert!("jump".parse::<ConsoleCommand>().is_err());
    }

    #[test]
    fn test_console_session() {
        let control = Arc::new(ScanControl::new());
        let handle = ScanHandle::new(control.clone());
        run_console(Cursor::new("pause\nbogus\n\nresume\npause\nexit\npause\n"), &handle);
        assert!(control.is_paused());
        assert!(control.is_stopped());
    }

    #[test]
    fn test_pause_resume_leaves_counters_alone() {
        let control = Arc::new(ScanControl::new());
        let handle = ScanHandle::new(control.clone());
        run_console(Cursor::new("pause\nresume\n"), &handle);
        assert!(!control.is_paused());
        assert!(!control.is_stopped());
        assert_eq!(control.iteration(), 0);
        assert!(!control.take_data_ready());
        assert!(!control.take_replot());
    }
}
