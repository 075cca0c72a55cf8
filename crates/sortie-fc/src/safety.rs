use std::sync::{Arc, Mutex, PoisonError};

use crate::command::CommandKind;

/// Tracks which command kinds are awaiting an acknowledgement.
///
/// At most one command of each kind may be outstanding; a second `claim`
/// of the same kind fails until the first [`InFlightClaim`] is dropped.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    pending: Arc<Mutex<Vec<CommandKind>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, kind: CommandKind) -> Option<InFlightClaim> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.contains(&kind) {
            return None;
        }
        pending.push(kind);
        Some(InFlightClaim { pending: self.pending.clone(), kind })
    }

    pub fn is_pending(&self, kind: CommandKind) -> bool {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).contains(&kind)
    }
}

/// Released on drop, whichever way the command finished.
#[derive(Debug)]
pub struct InFlightClaim {
    pending: Arc<Mutex<Vec<CommandKind>>>,
    kind: CommandKind,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|k| *k != self.kind);
    }
}
