//! AT-command composer/parser collaborator
//!
//! A deliberately thin seam: the bootstrap sequencer asks for formatted
//! command lines against a fixed buffer budget and hands raw reply text back
//! to the matching parsers. Nothing here knows about containers or sockets.

use std::fmt::Write;

use thiserror::Error;

/// The formatted line did not fit the configured budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("AT command exceeds the {budget}-byte buffer budget")]
pub(crate) struct BudgetExceeded {
    pub(crate) budget: usize,
}

fn check_budget(line: &str, budget: usize) -> Result<(), BudgetExceeded> {
    if line.len() > budget {
        return Err(BudgetExceeded { budget });
    }
    Ok(())
}

/// Format a config-read command for `key`
pub(crate) fn compose_getacfg(budget: usize, key: &str) -> Result<String, BudgetExceeded> {
    let mut line = String::new();
    // infallible for String
    let _ = write!(line, "AT%GETACFG=\"{key}\"\r");
    check_budget(&line, budget)?;
    Ok(line)
}

/// Format a config-write command for `key`
pub(crate) fn compose_setacfg(
    budget: usize,
    key: &str,
    value: &str,
) -> Result<String, BudgetExceeded> {
    let mut line = String::new();
    let _ = write!(line, "AT%SETACFG=\"{key}\",\"{value}\"\r");
    check_budget(&line, budget)?;
    Ok(line)
}

/// Whether the reply text ends in a terminal `OK`
pub(crate) fn check_atreply_ok(line: &str) -> bool {
    line.trim_end().ends_with("OK")
}

/// Extract the value from a `%GETACFG: <value>` reply, requiring terminal OK
pub(crate) fn atreply_value(line: &str) -> Option<&str> {
    if !check_atreply_ok(line) {
        return None;
    }
    let rest = line.split_once("%GETACFG:")?.1;
    let value = rest.lines().next()?.trim();
    Some(value)
}
