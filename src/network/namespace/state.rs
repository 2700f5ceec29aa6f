//! Namespace state machine
//!
//! Lifecycle of one namespace using the state-machines crate in dynamic
//! dispatch mode, so events can be fed in from the orchestrator at runtime.

use state_machines::state_machine;

state_machine! {
    name: NamespaceMachine,
    dynamic: true,
    initial: Absent,
    states: [Absent, Created, Linked, Configured],
    events {
        create {
            transition: { from: Absent, to: Created }
        }
        link {
            transition: { from: Created, to: Linked }
        }
        configure {
            transition: { from: Linked, to: Configured }
        }
        remove {
            transition: { from: [Created, Linked, Configured], to: Absent }
        }
    }
}

/// Lifecycle states as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Absent,
    Created,
    Linked,
    Configured,
}

impl State {
    pub fn from_machine(s: &str) -> Self {
        match s {
            "Created" => State::Created,
            "Linked" => State::Linked,
            "Configured" => State::Configured,
            _ => State::Absent,
        }
    }
}
