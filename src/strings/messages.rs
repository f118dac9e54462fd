//! User-facing reply text, collected in one place so wording stays
//! consistent across the router and the session prompts.

use crate::domain::message::{PartKind, Target};

pub const EMPTY_COMMAND: &str = "no command given, send \"help\" for the command list";

pub const UNKNOWN_COMMAND: &str = "unknown command, send \"help\" for the command list";

pub const BUSY: &str = "a command is already running, wait for it to finish or send the cancel keyword";

pub const NOT_CANCELABLE: &str = "the current command cannot be cancelled";

pub const CANCEL_PENDING: &str = "cancellation requested, the command is still winding down";

pub fn waiting_for_input(cancel_keyword: &str) -> String {
    format!("waiting for your input, send \"{cancel_keyword}\" to abort")
}

pub fn need_more_parts(kind: PartKind, missing: usize) -> String {
    let noun = kind.display_name();
    if missing == 1 {
        format!("please send 1 more {noun}")
    } else {
        format!("please send {missing} more {noun}s")
    }
}

pub fn redirected_input(target: Target) -> String {
    format!("the running command is waiting for input in {target}, answer there")
}
