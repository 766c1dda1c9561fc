//! Router commands for kill-switch rules.
//!
//! Block and allow-direct modes use a filter rule in the `forward` chain;
//! fallback mode uses a mangle rule that re-marks the device's traffic onto
//! another interface's routing table. Either way the rule is created disabled
//! and later only its `disabled` flag is toggled.

use crate::router::{parse_flag, RouterCommand, PATH_FILTER, PATH_MANGLE};
use crate::types::{DeviceRouting, KillSwitchMode};
use std::collections::HashMap;

/// Comment prefix shared by all kill-switch rules.
pub const KILL_SWITCH_COMMENT_PREFIX: &str = "nnc-killswitch-";
const FALLBACK_MARKER: &str = "fallback-";

/// Deterministic comment tagging a routing's kill-switch rule.
pub fn rule_comment(mode: KillSwitchMode, routing_id: &str) -> String {
    match mode {
        KillSwitchMode::FallbackService => {
            format!("{}{}{}", KILL_SWITCH_COMMENT_PREFIX, FALLBACK_MARKER, routing_id)
        }
        _ => format!("{}{}", KILL_SWITCH_COMMENT_PREFIX, routing_id),
    }
}

/// Routing ID encoded in a kill-switch comment, if it is one.
pub fn routing_id_from_comment(comment: &str) -> Option<&str> {
    let rest = comment.strip_prefix(KILL_SWITCH_COMMENT_PREFIX)?;
    let id = rest.strip_prefix(FALLBACK_MARKER).unwrap_or(rest);
    (!id.is_empty()).then_some(id)
}

/// Menu path holding rules for `mode`.
pub fn rule_path(mode: KillSwitchMode) -> &'static str {
    match mode {
        KillSwitchMode::FallbackService => PATH_MANGLE,
        _ => PATH_FILTER,
    }
}

fn disabled_flag(disabled: bool) -> &'static str {
    if disabled {
        "yes"
    } else {
        "no"
    }
}

/// Command creating a kill-switch rule.
///
/// `fallback_mark` is the routing mark traffic is re-marked to in fallback
/// mode and is ignored otherwise.
pub fn create_rule(
    routing: &DeviceRouting,
    mode: KillSwitchMode,
    fallback_mark: Option<&str>,
    disabled: bool,
) -> RouterCommand {
    let comment = rule_comment(mode, &routing.id);
    match mode {
        KillSwitchMode::FallbackService => RouterCommand::add(PATH_MANGLE)
            .arg("chain", "prerouting")
            .arg("src-mac-address", &routing.mac_address)
            .arg("action", "mark-routing")
            .arg("new-routing-mark", fallback_mark.unwrap_or_default())
            .arg("passthrough", "yes")
            .arg("comment", comment)
            .arg("disabled", disabled_flag(disabled)),
        KillSwitchMode::BlockAll | KillSwitchMode::AllowDirect => {
            let action = if mode == KillSwitchMode::BlockAll { "drop" } else { "accept" };
            RouterCommand::add(PATH_FILTER)
                .arg("chain", "forward")
                .arg("src-mac-address", &routing.mac_address)
                .arg("action", action)
                .arg("comment", comment)
                .arg("place-before", "0")
                .arg("disabled", disabled_flag(disabled))
        }
    }
}

/// Command setting a rule's disabled flag. An active kill switch has its rule enabled.
pub fn toggle_rule(path: &str, rule_id: &str, active: bool) -> RouterCommand {
    RouterCommand::set(path).with_id(rule_id).arg("disabled", disabled_flag(!active))
}

pub fn remove_rule(path: &str, rule_id: &str) -> RouterCommand {
    RouterCommand::remove(path).with_id(rule_id)
}

/// A kill-switch rule as seen on the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterRule {
    pub id: String,
    pub path: &'static str,
    pub routing_id: String,
    pub disabled: bool,
}

impl RouterRule {
    /// Parse a `print` row; `None` for rows that are not kill-switch rules.
    pub fn from_row(path: &'static str, row: &HashMap<String, String>) -> Option<Self> {
        let routing_id = routing_id_from_comment(row.get("comment")?)?;
        Some(Self {
            id: row.get(".id")?.clone(),
            path,
            routing_id: routing_id.to_string(),
            disabled: parse_flag(row.get("disabled")),
        })
    }
}
