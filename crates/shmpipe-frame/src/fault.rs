//! Named fault-injection checkpoints.
//!
//! A checkpoint is driven by a command string, normally taken from the
//! environment variable of the same name:
//!
//! ```text
//! frame_send="skip skip usleep=1000000 skip abort"
//! ```
//!
//! pauses the stream for one second on the third frame and aborts on the
//! fourth. Commands:
//!
//! * `skip` - pass this invocation.
//! * `usleep=<usecs>` - sleep, then carry on with the next command in the
//!   same invocation.
//! * `error` (or `gerror`) - fail this invocation.
//! * `abort` - raise `SIGABRT`.
//!
//! Once the commands run out every invocation passes. An unrecognised
//! command is logged and disables the checkpoint.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;

/// Checkpoint run by the attach handshake just before it replies.
pub const ATTACH_PRE_RETURN: &str = "attach_pre_return";
/// Checkpoint run by the payloader before each frame is written.
pub const FRAME_SEND: &str = "frame_send";

/// A checkpoint deliberately failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("fault injected at {checkpoint}")]
pub struct InjectedFault {
    pub checkpoint: String,
}

impl From<InjectedFault> for std::io::Error {
    fn from(fault: InjectedFault) -> Self {
        std::io::Error::other(fault)
    }
}

/// A pass/fail hook consulted at a fixed point in the data path.
pub trait FaultHook: Send + Sync {
    fn name(&self) -> &str;

    /// Run the checkpoint. May sleep or abort the process before returning.
    fn check(&self) -> Result<(), InjectedFault>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Skip,
    Sleep(Duration),
    Error,
    Abort,
}

fn parse_commands(name: &str, cmds: &str) -> VecDeque<Command> {
    let mut parsed = VecDeque::new();
    for word in cmds.split_whitespace() {
        let command = match word {
            "skip" => Command::Skip,
            "error" | "gerror" => Command::Error,
            "abort" => Command::Abort,
            _ => match word.strip_prefix("usleep=").map(str::parse::<u64>) {
                Some(Ok(us)) => Command::Sleep(Duration::from_micros(us)),
                _ => {
                    warn!(checkpoint = name, command = word, "ignoring invalid fault description");
                    break;
                }
            },
        };
        parsed.push_back(command);
    }
    parsed
}

/// A checkpoint driven by a command string.
#[derive(Debug)]
pub struct FaultInjectionPoint {
    name: String,
    commands: Mutex<VecDeque<Command>>,
}

impl FaultInjectionPoint {
    /// Read commands from the environment variable called `name`.
    pub fn from_env(name: &str) -> Self {
        let cmds = std::env::var(name).unwrap_or_default();
        Self::with_commands(name, &cmds)
    }

    pub fn with_commands(name: &str, cmds: &str) -> Self {
        Self {
            name: name.to_string(),
            commands: Mutex::new(parse_commands(name, cmds)),
        }
    }

    /// A checkpoint that always passes.
    pub fn disabled(name: &str) -> Self {
        Self::with_commands(name, "")
    }

    fn next(&self) -> Option<Command> {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }
}

impl FaultHook for FaultInjectionPoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> Result<(), InjectedFault> {
        // The lock is released between commands so a sleep does not block
        // other callers from reading the queue.
        while let Some(command) = self.next() {
            match command {
                Command::Skip => {
                    warn!(checkpoint = %self.name, "inject_fault: skip");
                    return Ok(());
                }
                Command::Sleep(duration) => {
                    warn!(checkpoint = %self.name, ?duration, "inject_fault: sleeping");
                    std::thread::sleep(duration);
                }
                Command::Error => {
                    warn!(checkpoint = %self.name, "inject_fault: returning error");
                    return Err(InjectedFault {
                        checkpoint: self.name.clone(),
                    });
                }
                Command::Abort => {
                    warn!(checkpoint = %self.name, "inject_fault: aborting");
                    std::process::abort();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn empty_commands_always_pass() {
        let point = FaultInjectionPoint::disabled(FRAME_SEND);
        for _ in 0..3 {
            assert!(point.check().is_ok());
        }
        assert_eq!(point.name(), FRAME_SEND);
    }

    #[test]
    fn commands_are_consumed_per_invocation() {
        let point = FaultInjectionPoint::with_commands(FRAME_SEND, "skip skip error skip");
        assert!(point.check().is_ok());
        assert!(point.check().is_ok());
        let err = point.check().unwrap_err();
        assert_eq!(err.checkpoint, FRAME_SEND);
        assert!(point.check().is_ok());
        assert!(point.check().is_ok());
    }

    #[test]
    fn gerror_is_accepted() {
        let point = FaultInjectionPoint::with_commands(ATTACH_PRE_RETURN, "gerror");
        assert!(point.check().is_err());
        assert!(point.check().is_ok());
    }

    #[test]
    fn sleep_runs_on_into_next_command() {
        let point = FaultInjectionPoint::with_commands(FRAME_SEND, "usleep=20000 error");
        let start = Instant::now();
        assert!(point.check().is_err());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn invalid_command_disables_the_rest() {
        let point = FaultInjectionPoint::with_commands(FRAME_SEND, "skip bogus error");
        assert!(point.check().is_ok());
        assert!(point.check().is_ok());
        assert!(point.check().is_ok());
    }

    #[test]
    fn from_env_reads_variable_named_after_checkpoint() {
        let name = format!("shmpipe_test_fault_{}", std::process::id());
        std::env::set_var(&name, "error");
        let point = FaultInjectionPoint::from_env(&name);
        std::env::remove_var(&name);
        assert!(point.check().is_err());
    }

    #[test]
    fn injected_fault_becomes_io_error() {
        let err: std::io::Error = InjectedFault {
            checkpoint: FRAME_SEND.to_string(),
        }
        .into();
        assert_eq!(err.kind(), std::io::ErrorKind::Other);
        assert!(err.to_string().contains(FRAME_SEND));
    }
}
