//! Slack predicates. Payload field: `channel`.

use super::{not_in_payload, policy, Policy};
use crate::models::{PolicyResult, WorkflowContext};

pub fn require_channel_allowlist(channels: Vec<String>) -> Policy {
    policy(move |context| {
        const NAME: &str = "require_channel_allowlist";
        let Some(channel) = context.payload_str("channel") else {
            return not_in_payload(NAME, "channel");
        };
        if channels.iter().any(|c| c == channel) {
            PolicyResult::pass(NAME, format!("Channel '{channel}' is permitted"))
        } else {
            PolicyResult::fail(
                NAME,
                format!("Channel '{channel}' not in allowlist: {channels:?}"),
            )
        }
    })
}

/// Blocks DM conversation IDs (`D…`) and user IDs (`U…`), which Slack turns
/// into a DM on delivery. Legacy group DMs (`G…`) are not caught.
pub fn block_dms(context: &WorkflowContext) -> PolicyResult {
    const NAME: &str = "block_dms";
    let Some(channel) = context.payload_str("channel") else {
        return not_in_payload(NAME, "channel");
    };
    if channel.starts_with('D') || channel.starts_with('U') {
        PolicyResult::fail(NAME, format!("DM channels are blocked (channel='{channel}')"))
    } else {
        PolicyResult::pass(NAME, format!("Channel '{channel}' is not a DM"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::testing::ctx;
    use serde_json::json;

    #[test]
    fn unlisted_channel_is_blocked_with_listing() {
        let p = require_channel_allowlist(vec!["C-ops".into(), "C-eng".into()]);
        assert!(p(&ctx(json!({"channel": "C-ops"}))).passed);
        let r = p(&ctx(json!({"channel": "C-random"})));
        assert!(!r.passed);
        assert_eq!(
            r.reason,
            r#"Channel 'C-random' not in allowlist: ["C-ops", "C-eng"]"#
        );
    }

    #[test]
    fn dms_and_user_ids_blocked() {
        assert!(!block_dms(&ctx(json!({"channel": "D456"}))).passed);
        assert!(!block_dms(&ctx(json!({"channel": "U123"}))).passed);
        assert!(block_dms(&ctx(json!({"channel": "C789"}))).passed);
    }
}
