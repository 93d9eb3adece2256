use std::{
    process::{Command, Stdio},
    sync::Arc,
    thread,
};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::telemetry::LockState;

/// The lock hardware. Calls are fire and forget, no outcome is reported back.
pub trait Actuator: Send + Sync {
    fn lock(&self);
    fn unlock(&self);
}

/// Runs an external program per action, e.g. a GPIO helper driving the key fob
pub struct ShellActuator {
    lock_cmd: Vec<String>,
    unlock_cmd: Vec<String>,
}

impl ShellActuator {
    /// Commands are split on whitespace, the first word is the program
    pub fn new(lock_cmd: &str, unlock_cmd: &str) -> Self {
        let split = |cmd: &str| cmd.split_whitespace().map(str::to_string).collect();
        Self {
            lock_cmd: split(lock_cmd),
            unlock_cmd: split(unlock_cmd),
        }
    }

    fn fire(argv: &[String]) {
        let Some((program, args)) = argv.split_first() else {
            warn!("No actuator command configured");
            return;
        };
        match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
        {
            Ok(mut child) => {
                // reaped off the caller's thread, which need not be inside a runtime
                let reaper = thread::Builder::new()
                    .name("actuator-reaper".to_string())
                    .spawn(move || match child.wait() {
                        Ok(status) => debug!("Actuator command exited with {status}"),
                        Err(err) => debug!("Could not wait on actuator command: {err}"),
                    });
                if let Err(err) = reaper {
                    warn!("Could not watch actuator command {program}: {err}");
                }
            }
            Err(err) => warn!("Could not run actuator command {program}: {err}"),
        }
    }
}

impl Actuator for ShellActuator {
    fn lock(&self) {
        Self::fire(&self.lock_cmd);
    }

    fn unlock(&self) {
        Self::fire(&self.unlock_cmd);
    }
}

/// Dry run actuator, only logs
pub struct LogActuator;

impl Actuator for LogActuator {
    fn lock(&self) {
        info!("(dry run) lock actuated");
    }

    fn unlock(&self) {
        info!("(dry run) unlock actuated");
    }
}

/// Maps command identifiers onto the actuator
pub struct CommandExecutor {
    actuator: Arc<dyn Actuator>,
}

impl CommandExecutor {
    pub fn new(actuator: Arc<dyn Actuator>) -> Self {
        Self { actuator }
    }

    /// Run `command`, returns whether it was recognised.
    /// Unknown commands are logged and otherwise ignored, they may come from any peer.
    pub fn execute(&self, command: &str, lock: &mut LockState) -> bool {
        match command {
            "lock" => {
                info!("Locking...");
                self.actuator.lock();
                *lock = LockState::Locked;
                true
            }
            "unlock" => {
                info!("Unlocking...");
                self.actuator.unlock();
                *lock = LockState::Unlocked;
                true
            }
            other => {
                warn!("Unsupported car command {other}");
                false
            }
        }
    }
}

#[derive(Deserialize)]
struct CommandMessage {
    cmd: String,
}

/// Pull the command identifier out of a message payload, either bare or `{"cmd": ...}`
pub fn decode_command(payload: &[u8]) -> Option<String> {
    let Ok(text) = std::str::from_utf8(payload) else {
        warn!("Received non utf8 command payload");
        return None;
    };
    let text = text.trim();
    if text.starts_with('{') {
        match serde_json::from_str::<CommandMessage>(text) {
            Ok(msg) => Some(msg.cmd),
            Err(err) => {
                warn!("Could not decode command message: {err}");
                None
            }
        }
    } else {
        Some(text.to_string())
    }
}
